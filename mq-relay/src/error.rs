//! Error types for broker and queue operations.
//!
//! Two layers:
//! - [`TransportError`]: what a [`crate::broker::Transport`] reports about a
//!   single broker call.
//! - [`QueueError`]: what callers of the connection manager and queue client
//!   see.

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use thiserror::Error;

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Failure reported by the transport for one broker call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The broker answered 404 for the named entity.
    #[error("not found: {0}")]
    NotFound(String),

    /// The channel or connection is closed (or closed during the call).
    #[error("closed: {0}")]
    Closed(String),

    /// Anything else: refused access, I/O failure, protocol error.
    #[error("{0}")]
    Other(String),
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                    TransportError::NotFound(amqp.to_string())
                }
                _ => TransportError::Other(amqp.to_string()),
            },
            lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::InvalidChannel(_)
            | lapin::Error::MissingHeartbeatError => TransportError::Closed(err.to_string()),
            _ => TransportError::Other(err.to_string()),
        }
    }
}

/// Errors surfaced by [`crate::ConnectionManager`] and [`crate::QueueClient`].
#[derive(Error, Debug)]
pub enum QueueError {
    /// Transport connection could not be opened (unreachable broker, bad credentials).
    #[error("failed to connect to broker: {0}")]
    Connection(#[source] TransportError),

    /// The connection opened but a channel could not be created on it.
    #[error("failed to open channel: {0}")]
    Channel(#[source] TransportError),

    /// Operation attempted without a live channel.
    #[error("no live channel to the broker")]
    NotConnected,

    /// The broker reports the queue no longer exists.
    #[error("queue '{queue}' no longer exists on the broker")]
    QueueGone { queue: String },

    /// The channel closed while the operation was in flight.
    #[error("channel closed during {operation}")]
    ChannelClosed { operation: &'static str },

    /// The broker did not answer within the operation timeout.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// The broker refused the operation for another reason.
    #[error("broker rejected {operation}: {reason}")]
    Broker {
        operation: &'static str,
        reason: String,
    },

    /// A structured payload could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether a fresh call may succeed, since every call re-runs the
    /// connect/assert sequence.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_)
            | Self::Channel(_)
            | Self::NotConnected
            | Self::QueueGone { .. }
            | Self::ChannelClosed { .. }
            | Self::Timeout { .. } => true,
            Self::Broker { .. } | Self::Serialization(_) => false,
        }
    }
}
