//! Error taxonomy for the relay.
//!
//! [`RelayError`] covers failures returned from relay operations. Only
//! [`RelayError::Bind`] and [`RelayError::ShutdownTimeout`] ever reach the
//! operator.
//!
//! Per-message and per-session failures never become a `RelayError`: a
//! [`ParseError`] is logged by the receive loop and the frame skipped, a
//! [`TransformError`] is logged by the processing worker and the envelope
//! skipped, and a closed transport ends only that session's loops (reported
//! as `LoopExit::TransportClosed` in `relay-server`).

use std::time::Duration;

use thiserror::Error;

/// Top-level error type for relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listening address could not be bound. Fatal at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The server configuration cannot run (e.g. a zero heartbeat interval).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shutdown did not finish in time; remaining transports were force-closed.
    #[error("shutdown did not complete within {timeout:?}")]
    ShutdownTimeout {
        /// The configured bound that was exceeded.
        timeout: Duration,
    },

    /// A queue was used after its consumer went away.
    #[error("queue closed")]
    QueueClosed,

    /// A lifecycle operation was requested from a state that does not allow it.
    #[error("cannot {action} while {state}")]
    InvalidState {
        /// The operation that was attempted.
        action: &'static str,
        /// The state the coordinator was in.
        state: String,
    },
}

impl RelayError {
    /// Whether this error is reported to the operator rather than contained.
    pub fn is_operator_visible(&self) -> bool {
        matches!(self, Self::Bind { .. } | Self::ShutdownTimeout { .. })
    }
}

/// A malformed inbound payload.
#[derive(Debug, Error)]
#[error("malformed payload: {reason}")]
pub struct ParseError {
    reason: String,
}

impl ParseError {
    /// Create a parse error with a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Why the payload was rejected.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<std::str::Utf8Error> for ParseError {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::new(format!("binary frame is not UTF-8: {err}"))
    }
}

/// Failure raised by a processing transform for a single envelope.
#[derive(Debug, Error)]
pub enum TransformError {
    /// The transform refused this envelope.
    #[error("envelope rejected: {0}")]
    Rejected(String),
    /// The transform failed while producing its output.
    #[error("transform failed: {0}")]
    Failed(String),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
