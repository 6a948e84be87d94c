//! Boundary between the coordinator and the master's wire protocol.
//!
//! A [`SchedulerClient`] sends calls and delivers inbound events, one at a
//! time, to an [`EventHandler`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lattice_id::{AgentId, ExecutorId, FrameworkId, OfferId, TaskId};
use lattice_protocol::{AckToken, Event, InverseOffer, MasterInfo, Offer, TaskInfo, TaskStatus};
use thiserror::Error;

/// Failures reported by the transport outside of any single call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The event stream ended before the scheduler stopped.
    #[error("connection to master closed prematurely")]
    ConnectionClosed,

    #[error("failed to connect to master: {0}")]
    Connect(String),

    #[error("failed to decode event: {0}")]
    Decode(String),

    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed)
    }
}

/// Outbound side of the scheduler protocol.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Opens the subscription and starts delivering events to `handler`.
    async fn subscribe(&self, url: &str, handler: Arc<dyn EventHandler>) -> Result<()>;

    async fn decline(&self, offer_ids: Vec<OfferId>) -> Result<()>;

    async fn accept(&self, offer_ids: Vec<OfferId>, tasks: Vec<TaskInfo>) -> Result<()>;

    async fn kill(&self, task_id: &TaskId) -> Result<()>;

    async fn acknowledge(&self, agent_id: &AgentId, task_id: &str, uuid: AckToken) -> Result<()>;

    async fn framework_message(
        &self,
        executor_id: &ExecutorId,
        agent_id: &AgentId,
        data: Vec<u8>,
    ) -> Result<()>;

    /// Closes the subscription. Later calls fail.
    async fn close(&self);
}

/// Inbound side of the scheduler protocol.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn subscribed(&self, framework_id: FrameworkId, master: MasterInfo);

    async fn offers(&self, offers: Vec<Offer>);

    async fn inverse_offers(&self, offers: Vec<InverseOffer>);

    async fn rescind(&self, offer_id: OfferId);

    async fn rescind_inverse_offer(&self, offer_id: OfferId);

    async fn status_update(&self, status: TaskStatus);

    async fn message(&self, executor_id: ExecutorId, agent_id: AgentId, data: Vec<u8>);

    async fn failure(
        &self,
        agent_id: Option<AgentId>,
        executor_id: Option<ExecutorId>,
        status: Option<i32>,
    );

    async fn error(&self, message: String);

    async fn heartbeat(&self);

    async fn on_uncaught_exception(&self, error: TransportError);

    async fn on_connect_exception(&self, error: TransportError);

    /// Number of inbound events the transport may buffer.
    fn event_buffer_size(&self) -> usize;
}

/// Routes one decoded event to the matching handler method.
pub async fn dispatch_event(handler: &dyn EventHandler, event: Event) {
    match event {
        Event::Subscribed {
            framework_id,
            master_info,
            ..
        } => handler.subscribed(framework_id, master_info).await,
        Event::Offers {
            offers,
            inverse_offers,
        } => {
            if !offers.is_empty() {
                handler.offers(offers).await;
            }
            if !inverse_offers.is_empty() {
                handler.inverse_offers(inverse_offers).await;
            }
        }
        Event::Rescind { offer_id } => handler.rescind(offer_id).await,
        Event::RescindInverseOffer { offer_id } => handler.rescind_inverse_offer(offer_id).await,
        Event::Update { status } => handler.status_update(status).await,
        Event::Message {
            agent_id,
            executor_id,
            data,
        } => handler.message(executor_id, agent_id, data).await,
        Event::Failure {
            agent_id,
            executor_id,
            status,
        } => handler.failure(agent_id, executor_id, status).await,
        Event::Error { message } => handler.error(message).await,
        Event::Heartbeat => handler.heartbeat().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{offer, HandlerEvent, RecordingEventHandler};

    #[tokio::test]
    async fn offers_and_inverse_offers_are_split() {
        let handler = RecordingEventHandler::new();
        let event = Event::Offers {
            offers: vec![offer("o1", "h1", 1.0, 128.0)],
            inverse_offers: vec![InverseOffer {
                id: OfferId::new("i1").unwrap(),
                agent_id: None,
            }],
        };

        dispatch_event(&handler, event).await;

        assert_eq!(
            handler.events(),
            vec![
                HandlerEvent::Offers(vec![OfferId::new("o1").unwrap()]),
                HandlerEvent::InverseOffers(1),
            ]
        );
    }

    #[tokio::test]
    async fn empty_offer_event_reaches_nobody() {
        let handler = RecordingEventHandler::new();
        dispatch_event(
            &handler,
            Event::Offers {
                offers: Vec::new(),
                inverse_offers: Vec::new(),
            },
        )
        .await;
        assert!(handler.events().is_empty());
    }

    #[tokio::test]
    async fn framework_events_route_by_kind() {
        let handler = RecordingEventHandler::new();
        let agent = AgentId::new("agent-h1").unwrap();

        dispatch_event(
            &handler,
            Event::Failure {
                agent_id: Some(agent.clone()),
                executor_id: None,
                status: None,
            },
        )
        .await;
        dispatch_event(
            &handler,
            Event::Error {
                message: "framework removed".to_string(),
            },
        )
        .await;
        dispatch_event(&handler, Event::Heartbeat).await;

        assert_eq!(
            handler.events(),
            vec![
                HandlerEvent::Failure(Some(agent), None),
                HandlerEvent::Error("framework removed".to_string()),
                HandlerEvent::Heartbeat,
            ]
        );
    }

    #[test]
    fn connection_closed_is_distinguished() {
        assert!(TransportError::ConnectionClosed.is_connection_closed());
        assert!(!TransportError::Decode("bad".to_string()).is_connection_closed());
    }
}
