//! Broker connection abstraction.
//!
//! The bus never talks to a transport directly. Everything it needs from a
//! publish/subscribe broker is described by [`BrokerConnection`]:
//! publishing bytes, exact and pattern subscriptions, an inbound message
//! callback, a readiness signal, duplication and disconnect.

use crate::error::EventBusResult;
use crate::types::ConnectionStatus;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

/// Callback fired once per inbound message with the raw channel name and
/// raw payload.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// A connection to a publish/subscribe broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Publish a payload, returning the number of subscribers that received it.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> EventBusResult<u64>;

    /// Subscribe to an exact channel.
    async fn subscribe(&self, channel: &str) -> EventBusResult<()>;

    /// Unsubscribe from an exact channel.
    async fn unsubscribe(&self, channel: &str) -> EventBusResult<()>;

    /// Subscribe to a glob pattern.
    async fn psubscribe(&self, pattern: &str) -> EventBusResult<()>;

    /// Unsubscribe from a glob pattern.
    async fn punsubscribe(&self, pattern: &str) -> EventBusResult<()>;

    /// Add an inbound message handler.
    ///
    /// Handlers are additive; registering the same logic twice delivers
    /// each message twice.
    fn on_message(&self, handler: MessageHandler);

    /// Current readiness.
    fn status(&self) -> ConnectionStatus;

    /// Readiness updates.
    fn status_changes(&self) -> watch::Receiver<ConnectionStatus>;

    /// Open an independent connection to the same broker endpoint.
    async fn duplicate(&self) -> EventBusResult<Arc<dyn BrokerConnection>>;

    /// Close the connection.
    async fn disconnect(&self) -> EventBusResult<()>;

    /// Backend name (e.g., "memory", "redis").
    fn name(&self) -> &str;
}
