//! Task kill bookkeeping: cleanup types, kill records, and the task store.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use lattice_id::{AgentId, ExecutorId, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

// =============================================================================
// Cleanup types
// =============================================================================

/// Why a whole request is being cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestCleanupType {
    Deleting,
    Pausing,
    Bounce,
    IncrementalBounce,
}

impl RequestCleanupType {
    /// The cleanup type applied to each task of the request.
    pub fn task_cleanup_type(&self) -> TaskCleanupType {
        match self {
            RequestCleanupType::Deleting => TaskCleanupType::RequestDeleting,
            RequestCleanupType::Pausing => TaskCleanupType::Pausing,
            RequestCleanupType::Bounce => TaskCleanupType::Bouncing,
            RequestCleanupType::IncrementalBounce => TaskCleanupType::IncrementalBounce,
        }
    }
}

/// Why an individual task is being killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCleanupType {
    UserRequested,
    UserRequestedDestroy,
    Decommissioning,
    ScalingDown,
    Bouncing,
    IncrementalBounce,
    DeployFailed,
    NewDeploySucceeded,
    DeployCanceled,
    UnhealthyNewTask,
    OverdueNewTask,
    TaskExceededTimeLimit,
    Pausing,
    RequestDeleting,
}

impl TaskCleanupType {
    /// Returns true if the executor should tear down everything it owns for
    /// the task, not just stop it.
    pub fn is_destroy(&self) -> bool {
        matches!(
            self,
            TaskCleanupType::UserRequestedDestroy | TaskCleanupType::RequestDeleting
        )
    }
}

// =============================================================================
// Kill requests and records
// =============================================================================

/// Arguments for `kill_and_record`.
#[derive(Debug, Clone, PartialEq)]
pub struct KillRequest {
    pub task_id: TaskId,
    pub request_cleanup_type: Option<RequestCleanupType>,
    pub task_cleanup_type: Option<TaskCleanupType>,
    /// Milliseconds since the epoch when the kill was first asked for.
    pub original_timestamp_ms: Option<i64>,
    pub retries: Option<u32>,
    pub user: Option<String>,
}

impl KillRequest {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            request_cleanup_type: None,
            task_cleanup_type: None,
            original_timestamp_ms: None,
            retries: None,
            user: None,
        }
    }

    pub fn request_cleanup(mut self, cleanup: RequestCleanupType) -> Self {
        self.request_cleanup_type = Some(cleanup);
        self
    }

    pub fn task_cleanup(mut self, cleanup: TaskCleanupType) -> Self {
        self.task_cleanup_type = Some(cleanup);
        self
    }

    pub fn original_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.original_timestamp_ms = Some(timestamp_ms);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Task-level cleanup wins; otherwise derive it from the request-level one.
    pub fn effective_cleanup_type(&self) -> Option<TaskCleanupType> {
        self.task_cleanup_type
            .or_else(|| self.request_cleanup_type.map(|r| r.task_cleanup_type()))
    }

    /// Retry count to persist: one more than the previous attempt, 0 for the
    /// first.
    pub fn retry_count(&self) -> u32 {
        self.retries.map_or(0, |r| r.saturating_add(1))
    }
}

/// Persisted record of a kill attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KilledTaskRecord {
    pub task_id: TaskId,
    pub killed_at: i64,
    pub original_request_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_cleanup_type: Option<RequestCleanupType>,
    /// As passed by the caller, never derived from `request_cleanup_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_cleanup_type: Option<TaskCleanupType>,
    pub retry_count: u32,
}

/// Framework message asking a custom executor to destroy a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDestroyMessage {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl TaskDestroyMessage {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

// =============================================================================
// Task store
// =============================================================================

/// What the scheduler knows about a launched task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub executor_id: Option<ExecutorId>,
    /// Command of the custom executor, if the task uses one.
    pub custom_executor_cmd: Option<String>,
}

impl TaskRecord {
    pub fn uses_custom_executor(&self) -> bool {
        self.custom_executor_cmd.is_some() && self.executor_id.is_some()
    }
}

/// Task data and kill history.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskRecord>>;

    async fn save_killed_record(&self, record: KilledTaskRecord) -> Result<()>;
}

/// Task store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    killed: RwLock<Vec<KilledTaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_task(&self, record: TaskRecord) {
        self.tasks.write().await.insert(record.task_id.clone(), record);
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Kill records saved for one task, oldest first.
    pub async fn killed_records(&self, task_id: &TaskId) -> Vec<KilledTaskRecord> {
        self.killed
            .read()
            .await
            .iter()
            .filter(|r| &r.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn save_killed_record(&self, record: KilledTaskRecord) -> Result<()> {
        debug!(
            task_id = %record.task_id,
            retry_count = record.retry_count,
            "Saving killed task record"
        );
        self.killed.write().await.push(record);
        Ok(())
    }
}
