//! Error types for the scheduler coordinator.

use thiserror::Error;

use crate::state::SchedulerState;

/// Result type for coordinator operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors raised by the coordinator.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A transition was attempted from the wrong state.
    #[error("invalid scheduler state: expected {expected}, was {actual}")]
    InvalidState {
        expected: SchedulerState,
        actual: SchedulerState,
    },

    /// The operation requires a subscribed scheduler.
    #[error("scheduler is not running (state {0})")]
    NotRunning(SchedulerState),

    /// No master was configured to subscribe to.
    #[error("no master configured")]
    NoMaster,

    #[error("offer matching failed: {0:#}")]
    Matcher(#[source] anyhow::Error),

    #[error("task launch failed: {0:#}")]
    Launch(#[source] anyhow::Error),

    #[error("transport call failed: {0:#}")]
    Transport(#[source] anyhow::Error),

    #[error("startup recovery failed: {0:#}")]
    Startup(#[source] anyhow::Error),

    #[error("status update for {task_id} failed: {source:#}")]
    StatusUpdate {
        task_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task store failed: {0:#}")]
    Store(#[source] anyhow::Error),
}

impl SchedulerError {
    /// Returns true when the operation was refused because the scheduler is
    /// not subscribed.
    pub fn is_not_running(&self) -> bool {
        matches!(self, SchedulerError::NotRunning(_))
    }
}
