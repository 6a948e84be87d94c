use lattice_id::{AgentId, ExecutorId};
use lattice_protocol::Call;
use lattice_scheduler::tasks::{RequestCleanupType, TaskCleanupType, TaskRecord};
use lattice_scheduler::testing::{task_id, TestHarness};
use lattice_scheduler::{KillRequest, SchedulerError, SchedulerState};

#[tokio::test]
async fn kill_fails_fast_when_not_subscribed() {
    let harness = TestHarness::new();
    let task = task_id("web", 1);

    let result = harness
        .coordinator
        .kill_and_record(KillRequest::new(task.clone()))
        .await;

    assert!(matches!(
        result,
        Err(SchedulerError::NotRunning(SchedulerState::NotStarted))
    ));
    assert!(harness.client.calls().is_empty());
    assert!(harness.task_store.killed_records(&task).await.is_empty());
}

#[tokio::test]
async fn retries_increase_retry_count() {
    let harness = TestHarness::new();
    harness.subscribe().await;
    let task = task_id("web", 1);

    for retries in [None, Some(0), Some(1)] {
        let mut request = KillRequest::new(task.clone()).task_cleanup(TaskCleanupType::ScalingDown);
        if let Some(retries) = retries {
            request = request.retries(retries);
        }
        harness.coordinator.kill_and_record(request).await.unwrap();
    }

    let counts: Vec<u32> = harness
        .task_store
        .killed_records(&task)
        .await
        .iter()
        .map(|r| r.retry_count)
        .collect();
    assert_eq!(counts, vec![0, 1, 2]);
    assert_eq!(harness.client.kills().len(), 3);
}

#[tokio::test]
async fn record_keeps_original_timestamp_and_cleanup() {
    let harness = TestHarness::new();
    harness.subscribe().await;

    let record = harness
        .coordinator
        .kill_and_record(
            KillRequest::new(task_id("web", 1))
                .request_cleanup(RequestCleanupType::Bounce)
                .original_timestamp(1_000),
        )
        .await
        .unwrap();
    assert_eq!(record.original_request_timestamp, 1_000);
    assert_eq!(record.request_cleanup_type, Some(RequestCleanupType::Bounce));
    assert_eq!(record.task_cleanup_type, None);

    let record = harness
        .coordinator
        .kill_and_record(KillRequest::new(task_id("web", 2)))
        .await
        .unwrap();
    assert_eq!(record.original_request_timestamp, record.killed_at);
    assert_eq!(record.task_cleanup_type, None);

    let record = harness
        .coordinator
        .kill_and_record(
            KillRequest::new(task_id("web", 3))
                .request_cleanup(RequestCleanupType::Bounce)
                .task_cleanup(TaskCleanupType::ScalingDown),
        )
        .await
        .unwrap();
    assert_eq!(record.request_cleanup_type, Some(RequestCleanupType::Bounce));
    assert_eq!(record.task_cleanup_type, Some(TaskCleanupType::ScalingDown));
}

#[tokio::test]
async fn destroy_sends_message_to_custom_executor_before_kill() {
    let harness = TestHarness::new();
    harness.subscribe().await;
    let task = task_id("web", 1);
    let executor = ExecutorId::new("custom-exec").unwrap();
    harness
        .task_store
        .insert_task(TaskRecord {
            task_id: task.clone(),
            agent_id: AgentId::new("agent-host1").unwrap(),
            executor_id: Some(executor.clone()),
            custom_executor_cmd: Some("/usr/bin/executor".to_string()),
        })
        .await;

    let record = harness
        .coordinator
        .kill_and_record(
            KillRequest::new(task.clone())
                .request_cleanup(RequestCleanupType::Deleting)
                .user("alice"),
        )
        .await
        .unwrap();
    assert_eq!(record.task_cleanup_type, None);

    let calls = harness.client.calls();
    assert_eq!(calls.len(), 2);
    let Call::Message {
        executor_id, data, ..
    } = &calls[0]
    else {
        panic!("expected destroy message first, got {:?}", calls[0]);
    };
    assert_eq!(executor_id, &executor);
    let message: serde_json::Value = serde_json::from_slice(data).unwrap();
    assert_eq!(message["taskId"], task.to_string());
    assert_eq!(message["user"], "alice");
    assert!(matches!(&calls[1], Call::Kill { task_id } if task_id == &task));
}

#[tokio::test]
async fn destroy_without_custom_executor_only_kills() {
    let harness = TestHarness::new();
    harness.subscribe().await;
    let task = task_id("web", 1);
    harness
        .task_store
        .insert_task(TaskRecord {
            task_id: task.clone(),
            agent_id: AgentId::new("agent-host1").unwrap(),
            executor_id: None,
            custom_executor_cmd: None,
        })
        .await;

    harness
        .coordinator
        .kill_and_record(KillRequest::new(task).task_cleanup(TaskCleanupType::UserRequestedDestroy))
        .await
        .unwrap();

    assert!(harness.client.messages().is_empty());
    assert_eq!(harness.client.kills().len(), 1);
    assert!(harness.notifier.messages().is_empty());
}

#[tokio::test]
async fn destroy_with_missing_task_data_is_reported_and_kill_proceeds() {
    let harness = TestHarness::new();
    harness.subscribe().await;
    let task = task_id("web", 1);

    harness
        .coordinator
        .kill_and_record(KillRequest::new(task.clone()).task_cleanup(TaskCleanupType::UserRequestedDestroy))
        .await
        .unwrap();

    let messages = harness.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("No task data available"));
    assert_eq!(harness.client.kills(), vec![task.clone()]);
    assert_eq!(harness.task_store.killed_records(&task).await.len(), 1);
    assert!(harness.coordinator.is_running());
}

#[tokio::test]
async fn failed_kill_call_is_still_recorded() {
    let harness = TestHarness::new();
    harness.subscribe().await;
    harness.client.set_fail_kill(true);
    let task = task_id("web", 1);

    let result = harness
        .coordinator
        .kill_and_record(KillRequest::new(task.clone()).retries(2))
        .await;

    assert!(matches!(result, Err(SchedulerError::Transport(_))));
    let records = harness.task_store.killed_records(&task).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].retry_count, 3);
}
