//! Error types surfaced to bridge callers.

use crate::transport::TransportError;

/// Why a `request` did not resolve with a value.
///
/// Every request settles exactly once, either with a value or with one of
/// these. `send` never fails; the equivalent conditions are logged instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// No counterpart endpoint could be resolved.
    #[error("target endpoint unavailable")]
    Unavailable,

    /// The counterpart answered with a failure response (no handler, or a
    /// handler error). Carries the remote error text verbatim.
    #[error("{0}")]
    Remote(String),

    /// No response arrived before the request's expiration.
    #[error("Request timeout: {id}")]
    Timeout { id: String },

    /// The queue plugin was at capacity.
    #[error("message queue full")]
    QueueFull,

    /// The queue plugin was cleared or destroyed before the entry was delivered.
    #[error("message queue cleared")]
    QueueCleared,

    /// The bridge was destroyed with the request outstanding.
    #[error("Bridge destroyed")]
    Destroyed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl BridgeError {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_carries_id() {
        let err = BridgeError::Timeout {
            id: "msg_1_7".to_string(),
        };
        assert_eq!(err.to_string(), "Request timeout: msg_1_7");
        assert!(err.is_timeout());
    }

    #[test]
    fn remote_message_is_verbatim() {
        let err = BridgeError::remote("No handler for message type: a:b");
        assert_eq!(err.to_string(), "No handler for message type: a:b");
        assert!(!err.is_timeout());
    }

    #[test]
    fn transport_errors_convert() {
        let err: BridgeError = TransportError::Closed.into();
        assert_eq!(err.to_string(), "transport error: transport closed");
    }
}
