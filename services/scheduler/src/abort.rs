//! Process abort signalling and exception reporting.
//!
//! Library code never exits the process. Fatal errors are turned into an
//! [`AbortSignal`] that the hosting binary waits on.

use std::fmt;

use tokio::sync::watch;
use tracing::{error, warn};

/// Why the scheduler asked the process to terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// The master reported an error or the transport failed.
    ProtocolError,
    /// The connection to the master closed unexpectedly.
    LostConnection,
    /// An internal failure the scheduler cannot recover from.
    UnrecoverableError,
}

impl AbortReason {
    /// Exit code the process terminates with.
    pub fn exit_code(&self) -> i32 {
        match self {
            AbortReason::ProtocolError => 2,
            AbortReason::LostConnection => 3,
            AbortReason::UnrecoverableError => 4,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbortReason::ProtocolError => "PROTOCOL_ERROR",
            AbortReason::LostConnection => "LOST_CONNECTION",
            AbortReason::UnrecoverableError => "UNRECOVERABLE_ERROR",
        };
        f.write_str(name)
    }
}

/// An abort request with an optional cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortSignal {
    pub reason: AbortReason,
    pub cause: Option<String>,
}

impl AbortSignal {
    pub fn new(reason: AbortReason) -> Self {
        Self {
            reason,
            cause: None,
        }
    }

    pub fn with_cause(reason: AbortReason, cause: impl fmt::Display) -> Self {
        Self {
            reason,
            cause: Some(cause.to_string()),
        }
    }
}

/// Receives abort requests.
pub trait AbortSink: Send + Sync {
    fn abort(&self, signal: AbortSignal);
}

/// Abort sink backed by a watch channel; `main` waits on the receiver.
#[derive(Debug)]
pub struct ProcessAbort {
    tx: watch::Sender<Option<AbortSignal>>,
}

impl ProcessAbort {
    pub fn new() -> (Self, watch::Receiver<Option<AbortSignal>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }
}

impl AbortSink for ProcessAbort {
    fn abort(&self, signal: AbortSignal) {
        error!(
            reason = %signal.reason,
            cause = signal.cause.as_deref().unwrap_or(""),
            "Aborting scheduler"
        );
        // Keep the first signal if several arrive.
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });
    }
}

/// Borrowed error handed to an [`ExceptionNotifier`].
pub type DynError = dyn std::error::Error + Send + Sync + 'static;

/// Reports anomalies and fatal errors to operators.
pub trait ExceptionNotifier: Send + Sync {
    fn notify(&self, message: &str, error: Option<&DynError>);
}

/// Notifier that only logs.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl ExceptionNotifier for TracingNotifier {
    fn notify(&self, message: &str, error: Option<&DynError>) {
        match error {
            Some(e) => warn!(error = %e, "{message}"),
            None => warn!("{message}"),
        }
    }
}
