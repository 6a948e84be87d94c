//! Status update queueing and dispatch.

use std::sync::atomic::Ordering;

use lattice_protocol::TaskStatus;
use tracing::{debug, warn};

use super::SchedulerCoordinator;
use crate::error::SchedulerError;

impl SchedulerCoordinator {
    /// Accepts a status update from the master.
    ///
    /// Before the subscription completes updates are queued, up to the
    /// configured bound; past it they are dropped unacknowledged so the
    /// master redelivers them. Once subscribed each update is processed on
    /// its own task.
    pub fn handle_status_update(&self, status: TaskStatus) {
        {
            let mut queued = self.queued();
            if !self.is_running() {
                let max = self.inner.config.max_queued_status_updates;
                if queued.len() >= max {
                    warn!(
                        task_id = %status.task_id,
                        state = ?status.state,
                        queued = queued.len(),
                        "Status update queue full, dropping update"
                    );
                } else {
                    debug!(
                        task_id = %status.task_id,
                        state = ?status.state,
                        scheduler_state = %self.state(),
                        "Queueing status update"
                    );
                    queued.push_back(status);
                }
                return;
            }
        }
        self.dispatch_status_update(status);
    }

    pub(super) fn dispatch_status_update(&self, status: TaskStatus) {
        self.inner.in_flight_updates.fetch_add(1, Ordering::AcqRel);
        let this = self.clone();
        tokio::spawn(async move {
            this.process_status_update(status).await;
            if this.inner.in_flight_updates.fetch_sub(1, Ordering::AcqRel) == 1 {
                this.inner.updates_idle.notify_waiters();
            }
        });
    }

    async fn process_status_update(&self, status: TaskStatus) {
        let deps = self.deps();

        if let Err(source) = deps.status_handler.process_status_update(&status).await {
            let err = SchedulerError::StatusUpdate {
                task_id: status.task_id.clone(),
                source,
            };
            self.fail("statusUpdate", &err).await;
        }

        if let Some(uuid) = status.uuid {
            match &status.agent_id {
                Some(agent_id) => {
                    if let Err(e) = deps.client.acknowledge(agent_id, &status.task_id, uuid).await {
                        warn!(task_id = %status.task_id, error = ?e, "Failed to acknowledge status update");
                    }
                }
                None => warn!(
                    task_id = %status.task_id,
                    "Status update has no agent, cannot acknowledge"
                ),
            }
        }

        if let Some(timestamp) = status.timestamp {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let delta_ms = now_ms - (timestamp * 1000.0) as i64;
            deps.status_delta.record(delta_ms.max(0) as u64);
        }
    }

    /// Waits until every dispatched status update has finished.
    pub async fn wait_for_status_updates(&self) {
        loop {
            let idle = self.inner.updates_idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.inner.in_flight_updates.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }
}
