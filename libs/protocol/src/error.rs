//! Error types for protocol encoding.

use thiserror::Error;

/// Errors that can occur when encoding or decoding protocol messages.
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    /// An inbound message could not be decoded.
    #[error("failed to decode event: {0}")]
    Decode(String),

    /// An outbound message could not be encoded.
    #[error("failed to encode call: {0}")]
    Encode(String),

    /// A message decoded but violates the protocol.
    #[error("invalid {kind} message: {message}")]
    Invalid { kind: &'static str, message: String },
}
