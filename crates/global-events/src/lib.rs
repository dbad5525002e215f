//! # Global Events
//!
//! An event emitter whose events also travel through a shared publish/subscribe
//! broker, so every process attached to the same broker and prefix sees them.
//!
//! ## Overview
//!
//! The global-events crate handles:
//! - **Local dispatch**: ordered listeners, `once` listeners, prepending
//! - **Remote delivery**: events are packed (MessagePack by default) and published on
//!   `<prefix>events:<event>`; inbound messages are dispatched locally only
//! - **Subscription tracking**: one wildcard pattern, or one channel per
//!   event that has listeners
//! - **Lifecycle**: deferred auto-subscribe, unsubscribe, disconnect
//!
//! ## Features
//!
//! - `memory` (default): in-process broker, used by the tests
//! - `redis`: Redis broker connection
//!
//! ## Usage
//!
//! ### Emitting and listening
//!
//! ```rust,no_run
//! use global_events::broker::memory::MemoryBroker;
//! use global_events::{BusConfig, EventBus, Origin};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!     let bus = EventBus::new(broker.connect(), BusConfig::default()).await?;
//!
//!     bus.on("user.created", |msg| {
//!         if msg.origin == Origin::Remote {
//!             println!("another process created {}", msg.data);
//!         }
//!     });
//!
//!     bus.emit("user.created", Some(serde_json::json!({"id": 42})));
//!     Ok(())
//! }
//! ```
//!
//! ### Per-event subscriptions
//!
//! ```rust,no_run
//! use global_events::broker::memory::MemoryBroker;
//! use global_events::{BusConfig, EventBus, SubscriptionMode};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!     let config = BusConfig::default().with_mode(SubscriptionMode::PerEvent);
//!     let bus = EventBus::new(broker.connect(), config).await?;
//!
//!     // Subscribes to "global-events:job.done" in the background
//!     let id = bus.on("job.done", |msg| println!("{}", msg.data));
//!
//!     // Last listener gone: unsubscribes in the background
//!     bus.off("job.done", id);
//!     Ok(())
//! }
//! ```
//!
//! ### Errors
//!
//! Background failures (publish, subscribe, unsubscribe, decoding) never
//! panic and are never retried. They are logged and sent to every
//! [`EventBus::errors`] receiver:
//!
//! ```rust,no_run
//! # async fn example(bus: global_events::EventBus) {
//! let mut errors = bus.errors();
//! while let Ok(error) = errors.recv().await {
//!     eprintln!("event bus: {}", error);
//! }
//! # }
//! ```
//!
//! ## Channels
//!
//! Events are published as `<prefix>events:<event>` (default prefix
//! `global-`). Wildcard mode pattern-subscribes `<prefix>events:*`.

pub mod broker;
pub mod bus;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use broker::{BrokerConnection, MessageHandler};
pub use bus::EventBus;
pub use channel::ChannelNaming;
pub use codec::{Codec, JsonCodec, JsonCodecOptions, MsgPackCodec, MsgPackCodecOptions};
pub use config::BusConfig;
pub use error::{EventBusError, EventBusResult};
pub use listener::{Listener, ListenerId};
pub use tracker::SubscriptionTracker;
pub use types::{
    BusState, ConnectionStatus, EmitOptions, EventBusStats, EventMessage, Origin, SubscriptionMode,
};

#[cfg(feature = "memory")]
pub use broker::memory::MemoryBroker;

#[cfg(feature = "redis")]
pub use broker::redis::{RedisConfig, RedisConnection};
