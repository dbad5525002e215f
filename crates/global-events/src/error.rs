//! Error types for the event bus.
//!
//! Errors raised by background work (fire-and-forget publishes, listener
//! driven subscriptions, auto-subscribe) have no caller to return to, so the
//! type is `Clone` and gets broadcast on the bus error channel.

use thiserror::Error;

/// Event bus error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventBusError {
    /// Broker rejected a publish
    #[error("Unable to publish event on '{channel}': {reason}")]
    Publish {
        /// Wire channel the publish targeted
        channel: String,
        /// Broker-supplied reason
        reason: String,
    },

    /// Broker rejected a subscribe or pattern-subscribe
    #[error("Unable to subscribe to '{channel}': {reason}")]
    Subscribe {
        /// Channel or pattern
        channel: String,
        /// Broker-supplied reason
        reason: String,
    },

    /// Broker rejected an unsubscribe or pattern-unsubscribe
    #[error("Unable to unsubscribe from '{channel}': {reason}")]
    Unsubscribe {
        /// Channel or pattern
        channel: String,
        /// Broker-supplied reason
        reason: String,
    },

    /// Receive connection has not signalled readiness yet
    #[error("Connection not ready")]
    NotReady,

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Payload could not be packed or unpacked
    #[error("Codec error: {0}")]
    Codec(String),

    /// The bus has been disconnected
    #[error("Event bus disconnected")]
    Disconnected,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EventBusError {
    /// Whether the error means the connection was not usable yet, as opposed
    /// to the broker rejecting the command.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, EventBusError::NotReady)
    }
}

impl From<serde_json::Error> for EventBusError {
    fn from(e: serde_json::Error) -> Self {
        EventBusError::Codec(e.to_string())
    }
}

/// Result type for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;
