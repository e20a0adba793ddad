//! Error types for the message-distribution core
//!
//! Comprehensive error taxonomy using thiserror. Message-scoped errors
//! (deserialization, callback) are contained per message by the bus;
//! connection-scoped errors surface to the immediate caller. No component
//! retries implicitly.

use thiserror::Error;

/// A wire event-type string outside the closed taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown event type: {value}")]
pub struct UnknownEventType {
    pub value: String,
}

/// Errors surfaced by event bus operations.
#[derive(Error, Debug)]
pub enum BusError {
    /// Operation attempted before `connect()` or after `disconnect()`.
    #[error("Bus is not connected")]
    NotConnected,

    /// `connect()` called on an already-connected instance. A bus instance
    /// is single-use per connection.
    #[error("Bus is already connected")]
    AlreadyConnected,

    /// Publish deadline exceeded. Fatal only to that call; distinct from
    /// `NotConnected`.
    #[error("Publish timed out after {timeout_ms}ms (routing key {routing_key})")]
    PublishTimeout {
        routing_key: String,
        timeout_ms: u64,
    },

    /// Queue declare/bind/consume failure, isolated to one subscription.
    #[error("Subscription failed for {routing_key}: {reason}")]
    Subscription {
        routing_key: String,
        reason: String,
    },

    /// Malformed payload. The message is dropped, never requeued.
    #[error("Deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Rejected before any broker interaction.
    #[error("Configuration error: {0}")]
    Configuration(#[from] UnknownEventType),

    /// The broker or connection has shut down.
    #[error("Broker connection closed: {reason}")]
    Closed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinct_from_not_connected() {
        let timeout = BusError::PublishTimeout {
            routing_key: "risk.breach".to_string(),
            timeout_ms: 5000,
        };
        assert!(timeout.to_string().contains("5000ms"));
        assert!(!matches!(timeout, BusError::NotConnected));
    }

    #[test]
    fn unknown_type_converts_to_configuration_error() {
        let err: BusError = UnknownEventType {
            value: "bogus".to_string(),
        }
        .into();
        assert!(matches!(err, BusError::Configuration(_)));
    }
}
