//! Shared value types for the event bus.
//!
//! Includes what listeners receive (`EventMessage`), the options accepted
//! by `emit`, and the enums describing connection, subscription and bus
//! lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EventBusError;

// ============================================================================
// Dispatch
// ============================================================================

/// Where a dispatched event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Emitted by this bus
    Local,
    /// Received from the broker
    Remote,
}

impl Origin {
    /// Marker string (`"local"` / `"remote"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as seen by a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Event name (without prefix or channel segment)
    pub event: String,
    /// Event payload
    pub data: serde_json::Value,
    /// Local emit or broker delivery
    pub origin: Origin,
    /// When the bus dispatched the event
    pub timestamp: DateTime<Utc>,
}

impl EventMessage {
    /// Create a new message stamped with the current time.
    pub fn new(event: impl Into<String>, data: serde_json::Value, origin: Origin) -> Self {
        Self {
            event: event.into(),
            data,
            origin,
            timestamp: Utc::now(),
        }
    }

    /// Whether the event was received from the broker.
    pub fn is_remote(&self) -> bool {
        self.origin == Origin::Remote
    }
}

/// Options accepted by `emit_with` / `emit_async`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitOptions {
    /// Skip the broker publish
    #[serde(default)]
    pub exclude_publish: bool,
    /// Skip local listener dispatch
    #[serde(default)]
    pub exclude_local: bool,
}

impl EmitOptions {
    /// Only notify local listeners.
    pub fn local_only() -> Self {
        Self {
            exclude_publish: true,
            exclude_local: false,
        }
    }

    /// Only publish to the broker.
    pub fn remote_only() -> Self {
        Self {
            exclude_publish: false,
            exclude_local: true,
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Readiness of a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not ready yet
    Connecting,
    /// Commands may be issued
    Ready,
    /// Closed; will not become ready again
    Disconnected,
}

/// How the bus receives remote events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionMode {
    /// One pattern subscription covering every event under the prefix
    #[default]
    Wildcard,
    /// One channel subscription per event with at least one local listener
    PerEvent,
}

impl SubscriptionMode {
    /// Whether broker subscriptions follow the local listener count.
    pub fn follows_listeners(&self) -> bool {
        matches!(self, SubscriptionMode::PerEvent)
    }
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionMode::Wildcard => f.write_str("wildcard"),
            SubscriptionMode::PerEvent => f.write_str("per-event"),
        }
    }
}

impl FromStr for SubscriptionMode {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wildcard" | "pattern" => Ok(SubscriptionMode::Wildcard),
            "per-event" | "per_event" | "event" => Ok(SubscriptionMode::PerEvent),
            other => Err(EventBusError::Config(format!(
                "unknown subscription mode '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle state of an `EventBus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusState {
    /// Created, no subscribe attempted
    Constructed,
    /// Subscribe in flight
    Subscribing,
    /// Receiving remote events
    Subscribed,
    /// Last subscribe attempt failed
    SubscribeFailed,
    /// Explicitly unsubscribed
    Unsubscribed,
    /// Receive connection closed (terminal)
    Disconnected,
}

impl BusState {
    /// Whether listener-driven subscriptions should reach the broker.
    pub fn accepts_subscriptions(&self) -> bool {
        !matches!(self, BusState::Unsubscribed | BusState::Disconnected)
    }
}

/// Event bus statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusStats {
    /// Publishes confirmed by the broker
    pub events_published: u64,
    /// Messages received from the broker
    pub events_received: u64,
    /// Listener invocations
    pub events_delivered: u64,
    /// Publishes rejected by the broker
    pub publish_failures: u64,
    /// Errors sent to the error channel
    pub errors_reported: u64,
}
