//! Inbound events delivered by the resource manager.

use lattice_id::{AgentId, ExecutorId, FrameworkId, OfferId};
use serde::{Deserialize, Serialize};

use crate::encoding::base64_bytes;
use crate::{InverseOffer, MasterInfo, Offer, ProtocolError, TaskStatus};

/// One event from the master's subscription stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Subscribed {
        framework_id: FrameworkId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heartbeat_interval_seconds: Option<f64>,
        master_info: MasterInfo,
    },
    Offers {
        #[serde(default)]
        offers: Vec<Offer>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        inverse_offers: Vec<InverseOffer>,
    },
    Rescind {
        offer_id: OfferId,
    },
    RescindInverseOffer {
        offer_id: OfferId,
    },
    Update {
        status: TaskStatus,
    },
    Message {
        agent_id: AgentId,
        executor_id: ExecutorId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Failure {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        executor_id: Option<ExecutorId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<i32>,
    },
    Error {
        message: String,
    },
    Heartbeat,
}

impl Event {
    /// Decodes a single JSON-encoded event.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// The wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Subscribed { .. } => "SUBSCRIBED",
            Event::Offers { .. } => "OFFERS",
            Event::Rescind { .. } => "RESCIND",
            Event::RescindInverseOffer { .. } => "RESCIND_INVERSE_OFFER",
            Event::Update { .. } => "UPDATE",
            Event::Message { .. } => "MESSAGE",
            Event::Failure { .. } => "FAILURE",
            Event::Error { .. } => "ERROR",
            Event::Heartbeat => "HEARTBEAT",
        }
    }
}
