//! Broker subscription tracking.
//!
//! Two strategies, picked once per bus:
//!
//! - [`WildcardSubscription`]: a single pattern subscription covering every
//!   event under the prefix. Listener count is irrelevant.
//! - [`EventSubscriptions`]: one exact-channel subscription per event that
//!   has local listeners.
//!
//! Every operation is idempotent and returns whether a broker command was
//! issued. Operations on the same pattern or event are serialized by an
//! async mutex held across the broker round trip, so a second caller sees
//! the effect of the first instead of issuing a duplicate command. A failed
//! command leaves the tracked state unchanged and returns the error; there
//! are no retries.

use crate::broker::BrokerConnection;
use crate::channel::ChannelNaming;
use crate::error::{EventBusError, EventBusResult};
use crate::types::SubscriptionMode;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

// ============================================================================
// Wildcard
// ============================================================================

/// Single pattern subscription (`<prefix>events:*`).
pub struct WildcardSubscription {
    conn: Arc<dyn BrokerConnection>,
    pattern: String,
    op_lock: AsyncMutex<()>,
    subscribed: AtomicBool,
}

impl WildcardSubscription {
    /// Create an unsubscribed tracker for the naming's pattern.
    pub fn new(conn: Arc<dyn BrokerConnection>, naming: &ChannelNaming) -> Self {
        Self {
            conn,
            pattern: naming.pattern(),
            op_lock: AsyncMutex::new(()),
            subscribed: AtomicBool::new(false),
        }
    }

    /// Pattern this tracker subscribes to.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the pattern subscription is held.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Pattern-subscribe unless already subscribed.
    pub async fn subscribe(&self) -> EventBusResult<bool> {
        let _guard = self.op_lock.lock().await;
        if self.is_subscribed() {
            return Ok(false);
        }

        self.conn.psubscribe(&self.pattern).await?;
        self.subscribed.store(true, Ordering::SeqCst);

        tracing::info!(pattern = %self.pattern, "Subscribed to event pattern");
        Ok(true)
    }

    /// Pattern-unsubscribe if subscribed.
    pub async fn unsubscribe(&self) -> EventBusResult<bool> {
        let _guard = self.op_lock.lock().await;
        if !self.is_subscribed() {
            return Ok(false);
        }

        self.conn.punsubscribe(&self.pattern).await?;
        self.subscribed.store(false, Ordering::SeqCst);

        tracing::info!(pattern = %self.pattern, "Unsubscribed from event pattern");
        Ok(true)
    }
}

// ============================================================================
// Per-event
// ============================================================================

/// One exact-channel subscription per tracked event.
pub struct EventSubscriptions {
    conn: Arc<dyn BrokerConnection>,
    naming: ChannelNaming,
    tracked: Mutex<HashSet<String>>,
    key_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl EventSubscriptions {
    /// Create a tracker with no subscriptions.
    pub fn new(conn: Arc<dyn BrokerConnection>, naming: ChannelNaming) -> Self {
        Self {
            conn,
            naming,
            tracked: Mutex::new(HashSet::new()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the event's channel is subscribed.
    pub fn is_subscribed(&self, event: &str) -> bool {
        self.tracked
            .lock()
            .map(|t| t.contains(event))
            .unwrap_or(false)
    }

    /// Tracked events, sorted.
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self
            .tracked
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        events.sort();
        events
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.tracked.lock().map(|t| t.is_empty()).unwrap_or(true)
    }

    /// Subscribe to the event's channel unless tracked.
    pub async fn subscribe(&self, event: &str) -> EventBusResult<bool> {
        let lock = self.key_lock(event);
        let result = {
            let _guard = lock.lock().await;
            self.subscribe_locked(event).await
        };
        self.release_key(event, lock);
        result
    }

    /// Unsubscribe from the event's channel if tracked.
    pub async fn unsubscribe(&self, event: &str) -> EventBusResult<bool> {
        let lock = self.key_lock(event);
        let result = {
            let _guard = lock.lock().await;
            self.unsubscribe_locked(event).await
        };
        self.release_key(event, lock);
        result
    }

    /// Bring the event's subscription in line with `wanted`, evaluated while
    /// holding the event's lock.
    ///
    /// Listener-driven changes go through here: `wanted` reads the live
    /// listener count, so whichever of several queued syncs runs last leaves
    /// the broker matching the registry, whatever order they were spawned in.
    pub async fn sync<F>(&self, event: &str, wanted: F) -> EventBusResult<bool>
    where
        F: FnOnce() -> bool + Send,
    {
        let lock = self.key_lock(event);
        let result = {
            let _guard = lock.lock().await;
            if wanted() {
                self.subscribe_locked(event).await
            } else {
                self.unsubscribe_locked(event).await
            }
        };
        self.release_key(event, lock);
        result
    }

    /// Unsubscribe every tracked event, returning the failures.
    pub async fn unsubscribe_all(&self) -> Vec<EventBusError> {
        let mut errors = Vec::new();
        for event in self.events() {
            if let Err(e) = self.unsubscribe(&event).await {
                errors.push(e);
            }
        }
        errors
    }

    async fn subscribe_locked(&self, event: &str) -> EventBusResult<bool> {
        if self.is_subscribed(event) {
            return Ok(false);
        }

        let channel = self.naming.to_channel(event);
        self.conn.subscribe(&channel).await?;
        if let Ok(mut tracked) = self.tracked.lock() {
            tracked.insert(event.to_string());
        }

        tracing::info!(event = %event, channel = %channel, "Subscribed to event channel");
        Ok(true)
    }

    async fn unsubscribe_locked(&self, event: &str) -> EventBusResult<bool> {
        if !self.is_subscribed(event) {
            return Ok(false);
        }

        let channel = self.naming.to_channel(event);
        self.conn.unsubscribe(&channel).await?;
        if let Ok(mut tracked) = self.tracked.lock() {
            tracked.remove(event);
        }

        tracing::info!(event = %event, channel = %channel, "Unsubscribed from event channel");
        Ok(true)
    }

    fn key_lock(&self, event: &str) -> Arc<AsyncMutex<()>> {
        match self.key_locks.lock() {
            Ok(mut locks) => locks
                .entry(event.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone(),
            Err(_) => Arc::new(AsyncMutex::new(())),
        }
    }

    /// Drop the event's lock entry once nobody else holds or awaits it.
    fn release_key(&self, event: &str, lock: Arc<AsyncMutex<()>>) {
        if let Ok(mut locks) = self.key_locks.lock() {
            // One reference in the map, one here
            if Arc::strong_count(&lock) == 2 && !self.is_subscribed(event) {
                locks.remove(event);
            }
        }
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// The subscription strategy of a bus.
pub enum SubscriptionTracker {
    /// Pattern subscription
    Wildcard(WildcardSubscription),
    /// Per-event channel subscriptions
    PerEvent(EventSubscriptions),
}

impl std::fmt::Debug for SubscriptionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionTracker")
            .field("mode", &self.mode())
            .field("subscriptions", &self.subscriptions())
            .finish()
    }
}

impl SubscriptionTracker {
    /// Create the tracker for a mode.
    pub fn new(mode: SubscriptionMode, conn: Arc<dyn BrokerConnection>, naming: ChannelNaming) -> Self {
        match mode {
            SubscriptionMode::Wildcard => {
                SubscriptionTracker::Wildcard(WildcardSubscription::new(conn, &naming))
            }
            SubscriptionMode::PerEvent => {
                SubscriptionTracker::PerEvent(EventSubscriptions::new(conn, naming))
            }
        }
    }

    /// Strategy in use.
    pub fn mode(&self) -> SubscriptionMode {
        match self {
            SubscriptionTracker::Wildcard(_) => SubscriptionMode::Wildcard,
            SubscriptionTracker::PerEvent(_) => SubscriptionMode::PerEvent,
        }
    }

    /// Whether any broker subscription is held.
    pub fn is_active(&self) -> bool {
        match self {
            SubscriptionTracker::Wildcard(w) => w.is_subscribed(),
            SubscriptionTracker::PerEvent(p) => !p.is_empty(),
        }
    }

    /// Whether remote events named `event` currently reach this bus.
    pub fn covers(&self, event: &str) -> bool {
        match self {
            SubscriptionTracker::Wildcard(w) => w.is_subscribed(),
            SubscriptionTracker::PerEvent(p) => p.is_subscribed(event),
        }
    }

    /// Held subscriptions: the pattern, or the tracked event names.
    pub fn subscriptions(&self) -> Vec<String> {
        match self {
            SubscriptionTracker::Wildcard(w) if w.is_subscribed() => vec![w.pattern().to_string()],
            SubscriptionTracker::Wildcard(_) => Vec::new(),
            SubscriptionTracker::PerEvent(p) => p.events(),
        }
    }

    /// Drop every held subscription, returning the failures.
    pub async fn unsubscribe_all(&self) -> Vec<EventBusError> {
        match self {
            SubscriptionTracker::Wildcard(w) => match w.unsubscribe().await {
                Ok(_) => Vec::new(),
                Err(e) => vec![e],
            },
            SubscriptionTracker::PerEvent(p) => p.unsubscribe_all().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{BrokerOp, MemoryBroker};

    fn per_event(broker: &MemoryBroker) -> EventSubscriptions {
        EventSubscriptions::new(broker.connect(), ChannelNaming::new("global-"))
    }

    #[tokio::test]
    async fn test_wildcard_idempotent() {
        let broker = MemoryBroker::new();
        let tracker = WildcardSubscription::new(broker.connect(), &ChannelNaming::new("global-"));

        assert!(!tracker.unsubscribe().await.unwrap());
        assert_eq!(broker.count_op(BrokerOp::PUnsubscribe), 0);

        assert!(tracker.subscribe().await.unwrap());
        assert!(!tracker.subscribe().await.unwrap());
        assert_eq!(broker.count(BrokerOp::PSubscribe, "global-events:*"), 1);
        assert!(tracker.is_subscribed());

        assert!(tracker.unsubscribe().await.unwrap());
        assert!(!tracker.unsubscribe().await.unwrap());
        assert_eq!(broker.count(BrokerOp::PUnsubscribe, "global-events:*"), 1);
    }

    #[tokio::test]
    async fn test_per_event_idempotent() {
        let broker = MemoryBroker::new();
        let tracker = per_event(&broker);

        assert!(tracker.subscribe("x").await.unwrap());
        assert!(!tracker.subscribe("x").await.unwrap());
        assert_eq!(broker.count(BrokerOp::Subscribe, "global-events:x"), 1);
        assert_eq!(tracker.events(), vec!["x".to_string()]);

        assert!(!tracker.unsubscribe("y").await.unwrap());
        assert_eq!(broker.count_op(BrokerOp::Unsubscribe), 0);

        assert!(tracker.unsubscribe("x").await.unwrap());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_failure_leaves_state_unchanged() {
        let broker = MemoryBroker::new();
        let tracker = per_event(&broker);

        broker.set_failing(BrokerOp::Subscribe, true);
        let err = tracker.subscribe("x").await.unwrap_err();
        assert!(matches!(err, EventBusError::Subscribe { .. }));
        assert!(!tracker.is_subscribed("x"));

        broker.set_failing(BrokerOp::Subscribe, false);
        tracker.subscribe("x").await.unwrap();

        broker.set_failing(BrokerOp::Unsubscribe, true);
        assert!(tracker.unsubscribe("x").await.is_err());
        assert!(tracker.is_subscribed("x"));

        let errors = tracker.unsubscribe_all().await;
        assert_eq!(errors.len(), 1);
        assert!(tracker.is_subscribed("x"));
    }

    #[tokio::test]
    async fn test_wildcard_failure_keeps_unsubscribed() {
        let broker = MemoryBroker::new();
        let tracker = WildcardSubscription::new(broker.connect(), &ChannelNaming::new(""));

        broker.set_failing(BrokerOp::PSubscribe, true);
        assert!(tracker.subscribe().await.is_err());
        assert!(!tracker.is_subscribed());
    }

    #[tokio::test]
    async fn test_sync_follows_wanted_state() {
        let broker = MemoryBroker::new();
        let tracker = per_event(&broker);

        assert!(tracker.sync("x", || true).await.unwrap());
        assert!(!tracker.sync("x", || true).await.unwrap());
        assert!(tracker.sync("x", || false).await.unwrap());
        assert!(!tracker.sync("x", || false).await.unwrap());

        assert_eq!(broker.count(BrokerOp::Subscribe, "global-events:x"), 1);
        assert_eq!(broker.count(BrokerOp::Unsubscribe, "global-events:x"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_same_event() {
        let broker = MemoryBroker::new();
        let tracker = Arc::new(per_event(&broker));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.subscribe("x").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(broker.count(BrokerOp::Subscribe, "global-events:x"), 1);
    }

    #[tokio::test]
    async fn test_strategy_views() {
        let broker = MemoryBroker::new();
        let wildcard = SubscriptionTracker::new(
            SubscriptionMode::Wildcard,
            broker.connect(),
            ChannelNaming::new("p-"),
        );
        assert_eq!(wildcard.mode(), SubscriptionMode::Wildcard);
        assert!(!wildcard.is_active());
        if let SubscriptionTracker::Wildcard(w) = &wildcard {
            w.subscribe().await.unwrap();
        }
        assert!(wildcard.covers("anything"));
        assert_eq!(wildcard.subscriptions(), vec!["p-events:*".to_string()]);
        assert!(wildcard.unsubscribe_all().await.is_empty());
        assert!(!wildcard.is_active());

        let per_event = SubscriptionTracker::new(
            SubscriptionMode::PerEvent,
            broker.connect(),
            ChannelNaming::new("p-"),
        );
        if let SubscriptionTracker::PerEvent(p) = &per_event {
            p.subscribe("b").await.unwrap();
            p.subscribe("a").await.unwrap();
        }
        assert!(per_event.covers("a"));
        assert!(!per_event.covers("c"));
        assert_eq!(per_event.subscriptions(), vec!["a".to_string(), "b".to_string()]);
        assert!(per_event.unsubscribe_all().await.is_empty());
        assert!(!per_event.is_active());
    }
}
