//! Event bus facade.
//!
//! `EventBus` combines a local listener registry with a broker connection:
//! `emit` notifies local listeners synchronously and publishes to the broker
//! in the background; events received from the broker are dispatched to the
//! same local listeners and never published again.
//!
//! # Example
//!
//! ```rust,no_run
//! use global_events::broker::memory::MemoryBroker;
//! use global_events::{BusConfig, EmitOptions, EventBus};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!     let bus = EventBus::new(broker.connect(), BusConfig::default()).await?;
//!
//!     bus.on("ping", |msg| println!("{} from {}", msg.data, msg.origin));
//!
//!     // Local listeners + broker
//!     bus.emit("ping", Some(serde_json::json!({"n": 1})));
//!
//!     // Broker only, waiting for the receiver count
//!     let receivers = bus
//!         .emit_async("ping", None, EmitOptions::remote_only())
//!         .await?;
//!     println!("delivered to {} subscribers", receivers);
//!     Ok(())
//! }
//! ```

use crate::broker::BrokerConnection;
use crate::channel::ChannelNaming;
use crate::codec::{self, Codec, MsgPackCodec};
use crate::config::BusConfig;
use crate::error::{EventBusError, EventBusResult};
use crate::listener::{Listener, ListenerId, ListenerRegistry, Placement};
use crate::tracker::SubscriptionTracker;
use crate::types::{BusState, EmitOptions, EventBusStats, EventMessage, Origin, SubscriptionMode};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use uuid::Uuid;

/// Event counters.
#[derive(Default)]
pub(crate) struct StatsCounters {
    events_published: AtomicU64,
    events_received: AtomicU64,
    events_delivered: AtomicU64,
    publish_failures: AtomicU64,
    errors_reported: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            errors_reported: self.errors_reported.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the bus handle, its background tasks and the
/// broker message handler.
pub(crate) struct BusInner {
    pub(crate) id: Uuid,
    pub(crate) naming: ChannelNaming,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) publisher: Arc<dyn BrokerConnection>,
    pub(crate) receiver: Arc<dyn BrokerConnection>,
    pub(crate) tracker: SubscriptionTracker,
    registry: RwLock<ListenerRegistry>,
    handler_installed: AtomicBool,
    state: Mutex<BusState>,
    /// Serializes subscribe / unsubscribe / disconnect
    pub(crate) lifecycle: AsyncMutex<()>,
    errors: broadcast::Sender<EventBusError>,
    /// Subscribed before any background task starts; handed to the first
    /// `errors()` caller so startup failures are buffered for it
    first_errors: Mutex<Option<broadcast::Receiver<EventBusError>>>,
    stats: StatsCounters,
    pub(crate) runtime: Handle,
}

/// Local/remote event bus.
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    pub(crate) inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("id", &self.inner.id)
            .field("prefix", &self.inner.naming.prefix())
            .field("mode", &self.inner.tracker.mode())
            .field("state", &self.inner.state())
            .finish()
    }
}

impl EventBus {
    /// Create a bus on a broker connection using the MessagePack codec.
    ///
    /// The connection is used for publishing; a duplicate is opened for
    /// receiving. Must be called within a Tokio runtime, which is where all
    /// background work of the bus runs.
    pub async fn new(connection: Arc<dyn BrokerConnection>, config: BusConfig) -> EventBusResult<Self> {
        Self::with_codec(connection, config, Arc::new(MsgPackCodec::new())).await
    }

    /// Create a bus with a custom codec.
    ///
    /// Fails only if the configuration is invalid or the receive connection
    /// cannot be opened; auto-subscribe failures go to [`EventBus::errors`].
    pub async fn with_codec(
        connection: Arc<dyn BrokerConnection>,
        config: BusConfig,
        codec: Arc<dyn Codec>,
    ) -> EventBusResult<Self> {
        config.validate()?;

        let receiver = connection.duplicate().await?;
        let naming = ChannelNaming::new(config.prefix.clone());
        let tracker = SubscriptionTracker::new(config.mode, receiver.clone(), naming.clone());
        let (errors, first_errors) = broadcast::channel(config.error_capacity);

        let inner = Arc::new(BusInner {
            id: Uuid::now_v7(),
            naming,
            codec,
            publisher: connection,
            receiver,
            tracker,
            registry: RwLock::new(ListenerRegistry::new()),
            handler_installed: AtomicBool::new(false),
            state: Mutex::new(BusState::Constructed),
            lifecycle: AsyncMutex::new(()),
            errors,
            first_errors: Mutex::new(Some(first_errors)),
            stats: StatsCounters::default(),
            runtime: Handle::current(),
        });

        tracing::info!(
            bus = %inner.id,
            prefix = %inner.naming.prefix(),
            mode = %config.mode,
            backend = inner.publisher.name(),
            codec = inner.codec.name(),
            "Event bus created"
        );

        if config.auto_subscribe {
            inner.spawn_auto_subscribe();
        }

        Ok(Self { inner })
    }

    // ------------------------------------------------------------------
    // Emit
    // ------------------------------------------------------------------

    /// Emit an event to local listeners and the broker.
    ///
    /// `None` data is sent as the no-data sentinel. See [`EventBus::emit_with`].
    pub fn emit(&self, event: &str, data: Option<Value>) -> bool {
        self.emit_with(event, data, EmitOptions::default())
    }

    /// Emit an event.
    ///
    /// The publish runs in the background (a failure is reported on the
    /// error channel); local listeners run before this returns. Returns
    /// `false` only when the payload cannot be packed, in which case nothing
    /// is published or dispatched.
    pub fn emit_with(&self, event: &str, data: Option<Value>, opts: EmitOptions) -> bool {
        let data = data.unwrap_or_else(codec::no_data);

        if !opts.exclude_publish {
            let payload = match self.inner.codec.pack(&data) {
                Ok(payload) => payload,
                Err(e) => {
                    self.inner.report(e);
                    return false;
                }
            };

            let channel = self.inner.naming.to_channel(event);
            let inner = self.inner.clone();
            self.inner.runtime.spawn(async move {
                if let Err(e) = inner.publish(&channel, payload).await {
                    inner.report(e);
                }
            });
        }

        if !opts.exclude_local {
            self.inner.dispatch(event, data, Origin::Local);
        }

        true
    }

    /// Emit an event and wait for the broker to confirm the publish.
    ///
    /// Local listeners run first. Returns the number of subscribers the
    /// broker delivered to (0 when the publish is excluded). Errors are
    /// returned, not reported on the error channel.
    pub async fn emit_async(
        &self,
        event: &str,
        data: Option<Value>,
        opts: EmitOptions,
    ) -> EventBusResult<u64> {
        let data = data.unwrap_or_else(codec::no_data);

        let publish = if opts.exclude_publish {
            None
        } else {
            let payload = self.inner.codec.pack(&data)?;
            Some((self.inner.naming.to_channel(event), payload))
        };

        if !opts.exclude_local {
            self.inner.dispatch(event, data, Origin::Local);
        }

        match publish {
            Some((channel, payload)) => self.inner.publish(&channel, payload).await,
            None => Ok(0),
        }
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Register a listener (alias of [`EventBus::add_listener`]).
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.add_listener(event, listener)
    }

    /// Append a listener for an event.
    pub fn add_listener<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.register_one(event, Arc::new(listener), Placement::Append, false)
    }

    /// Insert a listener before existing listeners of an event.
    pub fn prepend_listener<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.register_one(event, Arc::new(listener), Placement::Prepend, false)
    }

    /// Append a listener that is removed after its first invocation.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.register_one(event, Arc::new(listener), Placement::Append, true)
    }

    /// Prepend a listener that is removed after its first invocation.
    pub fn prepend_once_listener<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.register_one(event, Arc::new(listener), Placement::Prepend, true)
    }

    /// Append several listeners, returning their ids in order.
    pub fn add_listeners(&self, event: &str, listeners: Vec<Listener>) -> Vec<ListenerId> {
        self.register(event, listeners, Placement::Append, false)
    }

    /// Prepend several listeners (keeping their relative order).
    pub fn prepend_listeners(&self, event: &str, listeners: Vec<Listener>) -> Vec<ListenerId> {
        self.register(event, listeners, Placement::Prepend, false)
    }

    /// Append several one-shot listeners.
    pub fn once_listeners(&self, event: &str, listeners: Vec<Listener>) -> Vec<ListenerId> {
        self.register(event, listeners, Placement::Append, true)
    }

    /// Prepend several one-shot listeners (keeping their relative order).
    pub fn prepend_once_listeners(&self, event: &str, listeners: Vec<Listener>) -> Vec<ListenerId> {
        self.register(event, listeners, Placement::Prepend, true)
    }

    /// Remove a listener (alias of [`EventBus::remove_listener`]).
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.remove_listener(event, id)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, event: &str, id: ListenerId) -> bool {
        self.remove_listeners(event, &[id]) > 0
    }

    /// Remove several listeners of an event, returning how many were removed.
    pub fn remove_listeners(&self, event: &str, ids: &[ListenerId]) -> usize {
        let (removed, now_empty) = self.inner.registry_write().remove(event, ids);
        if now_empty {
            self.inner.listeners_changed(event);
        }
        removed
    }

    /// Remove every listener of the given events, or of all events.
    ///
    /// Per-event mode drops the broker subscription of every cleared event.
    /// In wildcard mode, clearing all events also drops the pattern
    /// subscription (the bus is then unsubscribed until `subscribe()`);
    /// clearing named events leaves the pattern in place.
    ///
    /// Returns the number of listeners removed.
    pub fn remove_all_listeners(&self, events: Option<&[&str]>) -> usize {
        let (removed, cleared) = {
            let mut registry = self.inner.registry_write();
            match events {
                Some(events) => {
                    let mut removed = 0;
                    let mut cleared = Vec::new();
                    for event in events {
                        let count = registry.clear_event(event);
                        if count > 0 {
                            removed += count;
                            cleared.push(event.to_string());
                        }
                    }
                    (removed, cleared)
                }
                None => {
                    let removed = registry
                        .event_names()
                        .iter()
                        .map(|event| registry.listener_count(event))
                        .sum();
                    (removed, registry.clear())
                }
            }
        };

        match self.inner.tracker.mode() {
            SubscriptionMode::PerEvent => {
                for event in &cleared {
                    self.inner.listeners_changed(event);
                }
            }
            SubscriptionMode::Wildcard if events.is_none() => {
                let inner = self.inner.clone();
                self.inner.runtime.spawn(async move {
                    if let Err(e) = inner.unsubscribe().await {
                        inner.report(e);
                    }
                });
            }
            SubscriptionMode::Wildcard => {}
        }

        tracing::debug!(bus = %self.inner.id, removed, events = ?cleared, "Listeners cleared");
        removed
    }

    fn register_one(&self, event: &str, listener: Listener, placement: Placement, once: bool) -> ListenerId {
        let ids = self.register(event, vec![listener], placement, once);
        // One callback in, one id out
        ids[0]
    }

    fn register(
        &self,
        event: &str,
        listeners: Vec<Listener>,
        placement: Placement,
        once: bool,
    ) -> Vec<ListenerId> {
        let (ids, was_empty) = self.inner.registry_write().add(event, listeners, placement, once);
        if was_empty && !ids.is_empty() {
            self.inner.listeners_changed(event);
        }
        ids
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Number of local listeners for an event.
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.listener_count(event)
    }

    /// Events with at least one local listener.
    pub fn event_names(&self) -> Vec<String> {
        self.inner.registry_read().event_names()
    }

    /// Channel prefix.
    pub fn prefix(&self) -> &str {
        self.inner.naming.prefix()
    }

    /// Wire channel for an event.
    pub fn channel_for(&self, event: &str) -> String {
        self.inner.naming.to_channel(event)
    }

    /// Subscription strategy.
    pub fn mode(&self) -> SubscriptionMode {
        self.inner.tracker.mode()
    }

    /// Subscription tracker.
    pub fn tracker(&self) -> &SubscriptionTracker {
        &self.inner.tracker
    }

    /// Whether any broker subscription is held.
    pub fn is_subscribed(&self) -> bool {
        self.inner.tracker.is_active()
    }

    /// Held subscriptions: the wildcard pattern, or the subscribed event names.
    pub fn subscribed_events(&self) -> Vec<String> {
        self.inner.tracker.subscriptions()
    }

    /// Lifecycle state.
    pub fn state(&self) -> BusState {
        self.inner.state()
    }

    /// Bus instance id (appears in logs).
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Counters snapshot.
    pub fn stats(&self) -> EventBusStats {
        self.inner.stats.snapshot()
    }

    /// Receive every error raised by background operations.
    ///
    /// The first receiver also holds errors reported since construction (up
    /// to the configured capacity), including auto-subscribe failures.
    /// Later receivers only see errors reported after the call.
    pub fn errors(&self) -> broadcast::Receiver<EventBusError> {
        let first = self
            .inner
            .first_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        first.unwrap_or_else(|| self.inner.errors.subscribe())
    }
}

impl BusInner {
    pub(crate) fn registry_read(&self) -> RwLockReadGuard<'_, ListenerRegistry> {
        self.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn registry_write(&self) -> RwLockWriteGuard<'_, ListenerRegistry> {
        self.registry.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn state(&self) -> BusState {
        *self.state_lock()
    }

    pub(crate) fn set_state(&self, state: BusState) {
        let previous = std::mem::replace(&mut *self.state_lock(), state);
        if previous != state {
            tracing::debug!(bus = %self.id, from = ?previous, to = ?state, "Event bus state changed");
        }
    }

    pub(crate) fn listener_count(&self, event: &str) -> usize {
        self.registry_read().listener_count(event)
    }

    /// Send an error to the error channel.
    pub(crate) fn report(&self, error: EventBusError) {
        self.stats.errors_reported.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(bus = %self.id, error = %error, "Event bus error");
        // No receivers is fine; the error is logged
        let _ = self.errors.send(error);
    }

    /// Publish a packed payload on the publish connection.
    pub(crate) async fn publish(&self, channel: &str, payload: Vec<u8>) -> EventBusResult<u64> {
        match self.publisher.publish(channel, payload).await {
            Ok(receivers) => {
                self.stats.events_published.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(bus = %self.id, channel = %channel, receivers, "Published event");
                Ok(receivers)
            }
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                Err(match e {
                    EventBusError::Publish { .. } | EventBusError::NotReady => e,
                    other => EventBusError::Publish {
                        channel: channel.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Invoke local listeners in registration order. Returns how many ran.
    pub(crate) fn dispatch(self: &Arc<Self>, event: &str, data: Value, origin: Origin) -> usize {
        let listeners = self.registry_read().snapshot(event);
        if listeners.is_empty() {
            return 0;
        }

        let message = EventMessage::new(event, data, origin);
        let mut delivered = 0u64;

        for listener in listeners {
            if listener.once {
                // Whoever removes the entry gets to run it
                let (removed, now_empty) = self.registry_write().remove(event, &[listener.id]);
                if removed == 0 {
                    continue;
                }
                if now_empty {
                    self.listeners_changed(event);
                }
            }

            (listener.callback)(&message);
            delivered += 1;
        }

        self.stats.events_delivered.fetch_add(delivered, Ordering::Relaxed);
        delivered as usize
    }

    /// Handle a raw broker message: decode and dispatch locally only.
    pub(crate) fn handle_message(self: &Arc<Self>, channel: &str, payload: &[u8]) {
        let Some(event) = self.naming.from_channel(channel) else {
            tracing::debug!(bus = %self.id, channel = %channel, "Ignoring message outside prefix");
            return;
        };

        self.stats.events_received.fetch_add(1, Ordering::Relaxed);

        let data = match self.codec.unpack(payload) {
            Ok(data) => data,
            Err(e) => {
                self.report(e);
                return;
            }
        };

        let delivered = self.dispatch(event, data, Origin::Remote);
        tracing::debug!(bus = %self.id, event = %event, delivered, "Received event");
    }

    /// Install the broker message handler exactly once.
    pub(crate) fn install_handler(self: &Arc<Self>) {
        if self.handler_installed.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        self.receiver.on_message(Arc::new(move |channel: &str, payload: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_message(channel, payload);
            }
        }));

        tracing::debug!(bus = %self.id, "Message handler installed");
    }

    /// An event gained its first or lost its last listener.
    ///
    /// In per-event mode, schedules a background sync of the event's broker
    /// subscription; failures go to the error channel and never roll back
    /// the registry.
    pub(crate) fn listeners_changed(self: &Arc<Self>, event: &str) {
        if !self.tracker.mode().follows_listeners() {
            return;
        }

        let inner = self.clone();
        let event = event.to_string();
        self.runtime.spawn(async move {
            if let Err(e) = inner.sync_event(&event).await {
                inner.report(e);
            }
        });
    }

    /// Reconcile one event's broker subscription with its listener count.
    pub(crate) async fn sync_event(self: &Arc<Self>, event: &str) -> EventBusResult<bool> {
        let SubscriptionTracker::PerEvent(subscriptions) = &self.tracker else {
            return Ok(false);
        };

        self.install_handler();

        let inner = self.clone();
        let name = event.to_string();
        subscriptions
            .sync(event, move || {
                inner.state().accepts_subscriptions() && inner.listener_count(&name) > 0
            })
            .await
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        // Can't disconnect from Drop; callers should use disconnect()
        tracing::debug!(bus = %self.id, "EventBus dropped");
    }
}
