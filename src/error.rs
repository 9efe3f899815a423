//! Error types for session operations.
//!
//! One taxonomy for everything a caller can observe: connect failures,
//! per-operation timeouts, broker protocol violations, offline-queue
//! rejection and cancellation. Connection loss is deliberately absent -
//! in-flight QoS 1/2 operations survive a drop and are resent, so the loss
//! is reported on the state channel instead of failing their handles.

use crate::config::ConfigError;
use crate::protocol::packet::ConnectReturnCode;
use crate::session::ConnectionState;
use std::time::Duration;
use thiserror::Error;

/// Main error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Connection establishment failed before a CONNACK was accepted.
    #[error("connect failed: {reason}")]
    Connect { reason: String },

    /// The broker answered CONNECT with a non-zero return code.
    #[error("broker refused connection: {0}")]
    ConnectRefused(ConnectReturnCode),

    /// An acknowledged operation did not complete within its deadline.
    #[error("operation timed out after {after:?}")]
    Timeout { after: Duration },

    /// The broker violated the protocol. The offending packet was ignored.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The offline queue is at capacity under the reject-new policy.
    #[error("offline queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The operation was cancelled by disconnect or shutdown.
    #[error("operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// The broker rejected a subscription with a SUBACK failure code.
    #[error("subscription rejected by broker: {filter}")]
    SubscribeRejected { filter: String },

    /// The operation requires an established connection.
    #[error("not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    /// Topic name or filter failed validation.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// All 65535 packet identifiers are currently in flight.
    #[error("no packet identifiers available")]
    PacketIdsExhausted,

    /// Transport-level I/O failure.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The session task has terminated; no further operations are possible.
    #[error("session closed")]
    Closed,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Create a cancellation error.
    pub fn cancelled<S: Into<String>>(reason: S) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a connect error.
    pub fn connect<S: Into<String>>(reason: S) -> Self {
        Self::Connect {
            reason: reason.into(),
        }
    }

    /// Create a protocol-violation error.
    pub fn protocol<S: Into<String>>(reason: S) -> Self {
        Self::Protocol(reason.into())
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            SessionError::connect("dial refused"),
            SessionError::ConnectRefused(ConnectReturnCode::NotAuthorized),
            SessionError::Timeout {
                after: Duration::from_secs(5),
            },
            SessionError::protocol("PUBACK with unknown packet id"),
            SessionError::QueueFull { capacity: 16 },
            SessionError::cancelled("session shut down"),
            SessionError::SubscribeRejected {
                filter: "a/#".to_string(),
            },
            SessionError::InvalidTopic("empty".to_string()),
            SessionError::PacketIdsExhausted,
            SessionError::Closed,
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_connect_refused_mentions_reason() {
        let error = SessionError::ConnectRefused(ConnectReturnCode::BadCredentials);
        assert!(error.to_string().contains("bad user name or password"));
    }

    #[test]
    fn test_timeout_carries_duration() {
        let error = SessionError::Timeout {
            after: Duration::from_secs(5),
        };
        assert!(error.to_string().contains("5s"));
    }
}
