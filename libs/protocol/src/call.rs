//! Outbound calls sent to the resource manager.

use lattice_id::{AgentId, ExecutorId, OfferId, TaskId};
use serde::{Deserialize, Serialize};

use crate::encoding::base64_bytes;
use crate::{AckToken, ProtocolError, TaskInfo};

/// One call from the scheduler to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Call {
    Subscribe {
        url: String,
    },
    Accept {
        offer_ids: Vec<OfferId>,
        tasks: Vec<TaskInfo>,
    },
    Decline {
        offer_ids: Vec<OfferId>,
    },
    Kill {
        task_id: TaskId,
    },
    Acknowledge {
        agent_id: AgentId,
        task_id: String,
        uuid: AckToken,
    },
    Message {
        agent_id: AgentId,
        executor_id: ExecutorId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl Call {
    /// Encodes the call as a single line of JSON.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}
