//! # lattice-protocol
//!
//! Types for the resource-manager scheduler protocol.
//!
//! ## Design Principles
//!
//! - The master is the source of truth; these types carry what it sends and
//!   nothing the scheduler derives locally
//! - Inbound traffic is a stream of [`Event`]s, outbound traffic a stream of
//!   [`Call`]s, both encoded as one JSON object per line with a `type` tag
//! - Binary payloads (framework messages) travel as standard base64
//!
//! ## Events
//!
//! - `SUBSCRIBED`: session established, carries the leader's [`MasterInfo`]
//! - `OFFERS` / `RESCIND`: resource grants and their withdrawal
//! - `UPDATE`: a [`TaskStatus`], optionally carrying an acknowledgment token
//! - `MESSAGE`, `FAILURE`, `ERROR`, `HEARTBEAT`: framework-level signals

mod call;
mod encoding;
mod error;
mod event;
mod types;

pub use call::Call;
pub use error::ProtocolError;
pub use event::Event;
pub use types::*;
