//! Killing tasks and recording the attempt.

use tracing::{error, info, warn};

use super::SchedulerCoordinator;
use crate::abort::DynError;
use crate::error::{SchedulerError, SchedulerResult};
use crate::tasks::{KillRequest, KilledTaskRecord, TaskDestroyMessage};

impl SchedulerCoordinator {
    /// Kills a task and persists a [`KilledTaskRecord`].
    ///
    /// Destroy-type cleanups first ask a custom executor to tear the task
    /// down. The kill record is saved even if the kill call fails.
    pub async fn kill_and_record(&self, request: KillRequest) -> SchedulerResult<KilledTaskRecord> {
        let state = self.state();
        if !state.is_running() {
            return Err(SchedulerError::NotRunning(state));
        }

        let deps = self.deps();
        let task_id = &request.task_id;
        let cleanup = request.effective_cleanup_type();

        if cleanup.is_some_and(|c| c.is_destroy()) {
            self.send_destroy_message(&request).await;
        }

        let kill_result = deps.client.kill(task_id).await;
        if let Err(e) = &kill_result {
            warn!(task_id = %task_id, error = ?e, "Kill call failed");
        }

        let now = chrono::Utc::now().timestamp_millis();
        let record = KilledTaskRecord {
            task_id: task_id.clone(),
            killed_at: now,
            original_request_timestamp: request.original_timestamp_ms.unwrap_or(now),
            request_cleanup_type: request.request_cleanup_type,
            task_cleanup_type: request.task_cleanup_type,
            retry_count: request.retry_count(),
        };
        deps.task_store
            .save_killed_record(record.clone())
            .await
            .map_err(SchedulerError::Store)?;

        info!(
            task_id = %task_id,
            cleanup = ?cleanup,
            retry_count = record.retry_count,
            "Killed task"
        );
        kill_result.map_err(SchedulerError::Transport)?;
        Ok(record)
    }

    async fn send_destroy_message(&self, request: &KillRequest) {
        let deps = self.deps();
        let task_id = &request.task_id;

        let task = match deps.task_store.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                let message = format!(
                    "No task data available to build kill task framework message for task {task_id}"
                );
                error!(task_id = %task_id, "{message}");
                deps.notifier.notify(&message, None);
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = ?e, "Failed to load task data");
                let source: &DynError = e.as_ref();
                deps.notifier
                    .notify(&format!("Failed to load task data for {task_id}"), Some(source));
                return;
            }
        };

        let (Some(executor_id), true) = (&task.executor_id, task.uses_custom_executor()) else {
            return;
        };

        let message = TaskDestroyMessage {
            task_id: task_id.clone(),
            user: request.user.clone(),
        };
        let data = match message.to_bytes() {
            Ok(data) => data,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to encode destroy message");
                return;
            }
        };

        info!(task_id = %task_id, executor_id = %executor_id, "Sending destroy message");
        if let Err(e) = deps
            .client
            .framework_message(executor_id, &task.agent_id, data)
            .await
        {
            warn!(task_id = %task_id, error = ?e, "Failed to send destroy message");
        }
    }
}
