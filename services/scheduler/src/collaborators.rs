//! Collaborator interfaces the coordinator calls out to, with the simple
//! implementations the binary runs with.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use lattice_id::{AgentId, ExecutorId};
use lattice_protocol::{MasterInfo, Offer, TaskStatus};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// =============================================================================
// Interfaces
// =============================================================================

/// Read-through cache of scheduler data that is only valid while leading.
#[async_trait]
pub trait LeaderCache: Send + Sync {
    async fn activate(&self);

    async fn stop(&self);
}

/// Work that must finish before status updates are processed.
#[async_trait]
pub trait StartupRecovery: Send + Sync {
    async fn startup(&self, master: &MasterInfo) -> Result<()>;
}

/// Whether an offer's host may take new tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferCheck {
    Accepting,
    NotAcceptingTasks,
}

/// Host and rack health bookkeeping.
#[async_trait]
pub trait HostHealth: Send + Sync {
    async fn check_offer(&self, offer: &Offer) -> OfferCheck;

    async fn agent_lost(&self, agent_id: &AgentId);
}

/// Handles messages sent by executors.
#[async_trait]
pub trait FrameworkMessageHandler: Send + Sync {
    async fn handle_message(
        &self,
        executor_id: &ExecutorId,
        agent_id: &AgentId,
        data: &[u8],
    ) -> Result<()>;
}

/// Applies a task status update to scheduler state.
#[async_trait]
pub trait StatusUpdateHandler: Send + Sync {
    async fn process_status_update(&self, status: &TaskStatus) -> Result<()>;
}

// =============================================================================
// Implementations
// =============================================================================

#[derive(Debug, Default)]
pub struct NoopLeaderCache;

#[async_trait]
impl LeaderCache for NoopLeaderCache {
    async fn activate(&self) {
        debug!("Leader cache activated");
    }

    async fn stop(&self) {
        debug!("Leader cache stopped");
    }
}

#[derive(Debug, Default)]
pub struct NoopStartupRecovery;

#[async_trait]
impl StartupRecovery for NoopStartupRecovery {
    async fn startup(&self, master: &MasterInfo) -> Result<()> {
        info!(master = %master.endpoint(), "Startup recovery complete");
        Ok(())
    }
}

/// Tracks hosts and agents that must not receive new tasks, and agents
/// reported lost.
#[derive(Debug, Default)]
pub struct InMemoryHostHealth {
    inactive_hosts: RwLock<HashSet<String>>,
    inactive_agents: RwLock<HashSet<AgentId>>,
    lost_agents: RwLock<Vec<AgentId>>,
}

impl InMemoryHostHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops placing tasks on a host.
    pub async fn decommission_host(&self, hostname: impl Into<String>) {
        self.inactive_hosts.write().await.insert(hostname.into());
    }

    /// Stops placing tasks on an agent.
    pub async fn decommission_agent(&self, agent_id: AgentId) {
        self.inactive_agents.write().await.insert(agent_id);
    }

    pub async fn lost_agents(&self) -> Vec<AgentId> {
        self.lost_agents.read().await.clone()
    }
}

#[async_trait]
impl HostHealth for InMemoryHostHealth {
    async fn check_offer(&self, offer: &Offer) -> OfferCheck {
        if self.inactive_hosts.read().await.contains(&offer.hostname)
            || self.inactive_agents.read().await.contains(&offer.agent_id)
        {
            OfferCheck::NotAcceptingTasks
        } else {
            OfferCheck::Accepting
        }
    }

    async fn agent_lost(&self, agent_id: &AgentId) {
        warn!(agent_id = %agent_id, "Agent lost");
        self.inactive_agents.write().await.insert(agent_id.clone());
        self.lost_agents.write().await.push(agent_id.clone());
    }
}

/// Logs executor messages.
#[derive(Debug, Default)]
pub struct LoggingMessageHandler;

#[async_trait]
impl FrameworkMessageHandler for LoggingMessageHandler {
    async fn handle_message(
        &self,
        executor_id: &ExecutorId,
        agent_id: &AgentId,
        data: &[u8],
    ) -> Result<()> {
        info!(
            executor_id = %executor_id,
            agent_id = %agent_id,
            bytes = data.len(),
            message = %String::from_utf8_lossy(data),
            "Framework message"
        );
        Ok(())
    }
}

/// Logs status updates.
#[derive(Debug, Default)]
pub struct LoggingStatusUpdateHandler;

#[async_trait]
impl StatusUpdateHandler for LoggingStatusUpdateHandler {
    async fn process_status_update(&self, status: &TaskStatus) -> Result<()> {
        info!(
            task_id = %status.task_id,
            state = ?status.state,
            terminal = status.state.is_terminal(),
            message = status.message.as_deref().unwrap_or(""),
            "Task status update"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lattice_id::{FrameworkId, OfferId};

    use super::*;

    fn offer(host: &str, agent: &str) -> Offer {
        Offer {
            id: OfferId::new(format!("offer-{host}")).unwrap(),
            framework_id: FrameworkId::new("fw").unwrap(),
            agent_id: AgentId::new(agent).unwrap(),
            hostname: host.to_string(),
            resources: vec![],
            attributes: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_host_health_checks_host_and_agent() {
        let health = InMemoryHostHealth::new();
        assert_eq!(
            health.check_offer(&offer("h1", "a1")).await,
            OfferCheck::Accepting
        );

        health.decommission_host("h1").await;
        assert_eq!(
            health.check_offer(&offer("h1", "a1")).await,
            OfferCheck::NotAcceptingTasks
        );

        health.agent_lost(&AgentId::new("a2").unwrap()).await;
        assert_eq!(
            health.check_offer(&offer("h2", "a2")).await,
            OfferCheck::NotAcceptingTasks
        );
        assert_eq!(health.lost_agents().await.len(), 1);
    }
}
