//! Subscribe, unsubscribe and disconnect.
//!
//! Lifecycle operations are serialized by the bus's lifecycle mutex. State
//! transitions:
//!
//! ```text
//! Constructed ──► Subscribing ──► Subscribed ──► Unsubscribed ──► Disconnected
//!                     │                ▲              │
//!                     └─► SubscribeFailed ────────────┘
//! ```
//!
//! `Disconnected` is terminal.

use crate::bus::{BusInner, EventBus};
use crate::error::{EventBusError, EventBusResult};
use crate::tracker::SubscriptionTracker;
use crate::types::{BusState, ConnectionStatus};
use std::collections::BTreeSet;
use std::sync::Arc;

impl EventBus {
    /// Subscribe the receive connection.
    ///
    /// Wildcard mode subscribes the pattern; per-event mode subscribes every
    /// event that currently has listeners. No-op when already subscribed.
    ///
    /// # Errors
    ///
    /// - `NotReady` if the receive connection is not ready
    /// - `Disconnected` after [`EventBus::disconnect`]
    /// - the first broker failure
    pub async fn subscribe(&self) -> EventBusResult<()> {
        self.inner.subscribe().await
    }

    /// Drop every broker subscription.
    ///
    /// Listener-driven subscriptions stay suspended until the next
    /// [`EventBus::subscribe`]. Listeners are kept.
    pub async fn unsubscribe(&self) -> EventBusResult<()> {
        self.inner.unsubscribe().await
    }

    /// Unsubscribe (best effort) and close the receive connection.
    ///
    /// Unsubscribe failures go to the error channel; only a failure to close
    /// the receive connection is returned. The publish connection belongs to
    /// the caller and is left open. Calling this again is a no-op.
    pub async fn disconnect(&self) -> EventBusResult<()> {
        self.inner.disconnect().await
    }

    /// Wait until the receive connection is ready.
    pub async fn wait_until_ready(&self) -> EventBusResult<()> {
        let mut changes = self.inner.receiver.status_changes();
        let ready = changes
            .wait_for(|status| *status != ConnectionStatus::Connecting)
            .await
            .map(|status| *status == ConnectionStatus::Ready)
            .map_err(|_| EventBusError::Disconnected)?;

        if ready {
            Ok(())
        } else {
            Err(EventBusError::Disconnected)
        }
    }
}

impl BusInner {
    pub(crate) async fn subscribe(self: &Arc<Self>) -> EventBusResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.subscribe_locked().await
    }

    /// Subscribe on behalf of auto-subscribe.
    ///
    /// Only acts while nothing has been subscribed yet (`Constructed`, or
    /// `SubscribeFailed` from a subscribe attempted before readiness). An
    /// unsubscribe or disconnect issued while the receive connection was
    /// coming up wins.
    async fn auto_subscribe(self: &Arc<Self>) -> EventBusResult<()> {
        let _guard = self.lifecycle.lock().await;

        let state = self.state();
        if !matches!(state, BusState::Constructed | BusState::SubscribeFailed) {
            tracing::debug!(bus = %self.id, state = ?state, "Skipping auto-subscribe");
            return Ok(());
        }

        self.subscribe_locked().await
    }

    /// Caller holds the lifecycle lock.
    async fn subscribe_locked(self: &Arc<Self>) -> EventBusResult<()> {
        match self.state() {
            BusState::Disconnected => return Err(EventBusError::Disconnected),
            BusState::Subscribed => return Ok(()),
            _ => {}
        }

        if self.receiver.status() != ConnectionStatus::Ready {
            self.set_state(BusState::SubscribeFailed);
            return Err(EventBusError::NotReady);
        }

        self.set_state(BusState::Subscribing);
        self.install_handler();

        let result = match &self.tracker {
            SubscriptionTracker::Wildcard(wildcard) => wildcard.subscribe().await.map(|_| ()),
            SubscriptionTracker::PerEvent(_) => {
                let events = self.registry_read().event_names();
                let mut first_error = None;
                for event in events {
                    if let Err(e) = self.sync_event(&event).await {
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        };

        match &result {
            Ok(()) => {
                self.set_state(BusState::Subscribed);
                tracing::info!(
                    bus = %self.id,
                    subscriptions = ?self.tracker.subscriptions(),
                    "Event bus subscribed"
                );
            }
            Err(e) => {
                self.set_state(BusState::SubscribeFailed);
                tracing::debug!(bus = %self.id, error = %e, "Event bus subscribe failed");
            }
        }

        result
    }

    pub(crate) async fn unsubscribe(self: &Arc<Self>) -> EventBusResult<()> {
        let _guard = self.lifecycle.lock().await;

        if self.state() == BusState::Disconnected {
            return Ok(());
        }

        self.set_state(BusState::Unsubscribed);
        let mut errors = self.drop_subscriptions().await;

        tracing::info!(bus = %self.id, failures = errors.len(), "Event bus unsubscribed");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.remove(0))
        }
    }

    pub(crate) async fn disconnect(self: &Arc<Self>) -> EventBusResult<()> {
        let _guard = self.lifecycle.lock().await;

        if self.state() == BusState::Disconnected {
            return Ok(());
        }

        self.set_state(BusState::Disconnected);
        for error in self.drop_subscriptions().await {
            self.report(error);
        }

        self.receiver.disconnect().await?;
        tracing::info!(bus = %self.id, "Event bus disconnected");
        Ok(())
    }

    /// Unsubscribe everything held, returning the failures.
    ///
    /// The state must already reject subscriptions, so listener-driven
    /// syncs queued behind these calls do not resubscribe.
    async fn drop_subscriptions(&self) -> Vec<EventBusError> {
        match &self.tracker {
            SubscriptionTracker::Wildcard(_) => self.tracker.unsubscribe_all().await,
            SubscriptionTracker::PerEvent(subscriptions) => {
                // Events with a subscribe in flight are not tracked yet but
                // still have listeners; waiting on their lock catches them
                let events: BTreeSet<String> = subscriptions
                    .events()
                    .into_iter()
                    .chain(self.registry_read().event_names())
                    .collect();

                let mut errors = Vec::new();
                for event in events {
                    if let Err(e) = subscriptions.unsubscribe(&event).await {
                        errors.push(e);
                    }
                }
                errors
            }
        }
    }

    /// Subscribe in the background once the receive connection is ready.
    ///
    /// Waits for a single transition out of `Connecting`; a connection that
    /// goes anywhere but `Ready` is reported as `NotReady` and not retried.
    /// Does nothing if the bus was subscribed, unsubscribed or disconnected
    /// in the meantime.
    pub(crate) fn spawn_auto_subscribe(self: &Arc<Self>) {
        let inner = self.clone();
        self.runtime.spawn(async move {
            if inner.receiver.status() == ConnectionStatus::Connecting {
                tracing::debug!(bus = %inner.id, "Waiting for receive connection");
                let mut changes = inner.receiver.status_changes();
                let settled = changes
                    .wait_for(|status| *status != ConnectionStatus::Connecting)
                    .await
                    .is_ok();
                if !settled {
                    inner.report(EventBusError::NotReady);
                    return;
                }
            }

            if let Err(e) = inner.auto_subscribe().await {
                inner.report(e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::memory::{BrokerOp, MemoryBroker};
    use crate::config::BusConfig;
    use crate::error::EventBusError;
    use crate::test_support::{eventually, settle};
    use crate::types::{BusState, ConnectionStatus, SubscriptionMode};
    use crate::EventBus;
    use std::time::Duration;

    fn manual() -> BusConfig {
        BusConfig::default().with_auto_subscribe(false)
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let broker = MemoryBroker::new();
        let bus = EventBus::new(broker.connect(), manual()).await.unwrap();
        assert_eq!(bus.state(), BusState::Constructed);

        bus.subscribe().await.unwrap();
        bus.subscribe().await.unwrap();
        assert_eq!(bus.state(), BusState::Subscribed);
        assert_eq!(broker.count(BrokerOp::PSubscribe, "global-events:*"), 1);
    }

    #[tokio::test]
    async fn test_subscribe_not_ready() {
        let broker = MemoryBroker::with_status(ConnectionStatus::Connecting);
        let bus = EventBus::new(broker.connect(), manual()).await.unwrap();

        let err = bus.subscribe().await.unwrap_err();
        assert_eq!(err, EventBusError::NotReady);
        assert_eq!(bus.state(), BusState::SubscribeFailed);
        assert_eq!(broker.count_op(BrokerOp::PSubscribe), 0);
    }

    #[tokio::test]
    async fn test_subscribe_failure_sets_state() {
        let broker = MemoryBroker::new();
        let bus = EventBus::new(broker.connect(), manual()).await.unwrap();
        broker.set_failing(BrokerOp::PSubscribe, true);

        assert!(bus.subscribe().await.is_err());
        assert_eq!(bus.state(), BusState::SubscribeFailed);
        assert!(!bus.is_subscribed());

        broker.set_failing(BrokerOp::PSubscribe, false);
        bus.subscribe().await.unwrap();
        assert!(bus.is_subscribed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_auto_subscribe_failure_reaches_errors() {
        for _ in 0..50 {
            let broker = MemoryBroker::new();
            broker.set_failing(BrokerOp::PSubscribe, true);
            let bus = EventBus::new(broker.connect(), BusConfig::default())
                .await
                .unwrap();

            let mut errors = bus.errors();
            let err = tokio::time::timeout(Duration::from_secs(2), errors.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(err, EventBusError::Subscribe { .. }));
            assert_eq!(bus.state(), BusState::SubscribeFailed);
        }
    }

    #[tokio::test]
    async fn test_auto_subscribe_waits_for_ready() {
        let broker = MemoryBroker::with_status(ConnectionStatus::Connecting);
        let bus = EventBus::new(broker.connect(), BusConfig::default())
            .await
            .unwrap();
        settle().await;
        assert_eq!(broker.count_op(BrokerOp::PSubscribe), 0);
        assert_eq!(bus.state(), BusState::Constructed);

        broker.set_status(ConnectionStatus::Ready);
        bus.wait_until_ready().await.unwrap();

        assert!(eventually(|| bus.state() == BusState::Subscribed).await);
        assert_eq!(broker.count(BrokerOp::PSubscribe, "global-events:*"), 1);
    }

    #[tokio::test]
    async fn test_auto_subscribe_after_early_subscribe_attempt() {
        let broker = MemoryBroker::with_status(ConnectionStatus::Connecting);
        let bus = EventBus::new(broker.connect(), BusConfig::default())
            .await
            .unwrap();
        assert_eq!(bus.subscribe().await.unwrap_err(), EventBusError::NotReady);

        broker.set_status(ConnectionStatus::Ready);
        assert!(eventually(|| bus.state() == BusState::Subscribed).await);
        assert_eq!(broker.count(BrokerOp::PSubscribe, "global-events:*"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_before_ready_wins() {
        let broker = MemoryBroker::with_status(ConnectionStatus::Connecting);
        let bus = EventBus::new(broker.connect(), BusConfig::default())
            .await
            .unwrap();
        let mut errors = bus.errors();

        bus.unsubscribe().await.unwrap();
        assert_eq!(bus.state(), BusState::Unsubscribed);

        broker.set_status(ConnectionStatus::Ready);
        bus.wait_until_ready().await.unwrap();
        settle().await;

        assert_eq!(bus.state(), BusState::Unsubscribed);
        assert!(!bus.is_subscribed());
        assert_eq!(broker.count_op(BrokerOp::PSubscribe), 0);
        assert!(errors.try_recv().is_err());

        // Explicit subscribe still works afterwards
        bus.subscribe().await.unwrap();
        assert!(bus.is_subscribed());
    }

    #[tokio::test]
    async fn test_disconnect_before_ready_is_quiet() {
        let broker = MemoryBroker::with_status(ConnectionStatus::Connecting);
        let bus = EventBus::new(broker.connect(), BusConfig::default())
            .await
            .unwrap();
        let mut errors = bus.errors();

        bus.disconnect().await.unwrap();
        broker.set_status(ConnectionStatus::Ready);
        settle().await;

        assert_eq!(bus.state(), BusState::Disconnected);
        assert_eq!(broker.count_op(BrokerOp::PSubscribe), 0);
        assert!(errors.try_recv().is_err());
        assert_eq!(bus.wait_until_ready().await.unwrap_err(), EventBusError::Disconnected);
    }

    #[tokio::test]
    async fn test_per_event_subscribe_covers_existing_listeners() {
        let broker = MemoryBroker::new();
        let config = manual().with_mode(SubscriptionMode::PerEvent);
        let bus = EventBus::new(broker.connect(), config).await.unwrap();

        // Listener-driven syncs run even before subscribe()
        bus.on("a", |_| {});
        bus.on("b", |_| {});
        bus.subscribe().await.unwrap();

        assert_eq!(bus.subscribed_events(), vec!["a".to_string(), "b".to_string()]);

        // The background syncs from on() find the events covered
        settle().await;
        assert_eq!(broker.count(BrokerOp::Subscribe, "global-events:a"), 1);
        assert_eq!(broker.count(BrokerOp::Subscribe, "global-events:b"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_suspends_listener_subscriptions() {
        let broker = MemoryBroker::new();
        let config = BusConfig::default().with_mode(SubscriptionMode::PerEvent);
        let bus = EventBus::new(broker.connect(), config).await.unwrap();
        bus.on("a", |_| {});
        assert!(eventually(|| bus.tracker().covers("a")).await);

        bus.unsubscribe().await.unwrap();
        assert_eq!(bus.state(), BusState::Unsubscribed);
        assert!(!bus.is_subscribed());

        bus.on("b", |_| {});
        settle().await;
        assert_eq!(broker.count_op(BrokerOp::Subscribe), 1);

        bus.subscribe().await.unwrap();
        assert_eq!(bus.subscribed_events(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_is_terminal_and_idempotent() {
        let broker = MemoryBroker::new();
        let publisher = broker.connect();
        let bus = EventBus::new(publisher.clone(), BusConfig::default())
            .await
            .unwrap();
        assert!(eventually(|| bus.is_subscribed()).await);
        assert_eq!(broker.connection_count(), 2);

        bus.disconnect().await.unwrap();
        bus.disconnect().await.unwrap();

        assert_eq!(bus.state(), BusState::Disconnected);
        assert_eq!(broker.count(BrokerOp::PUnsubscribe, "global-events:*"), 1);
        assert_eq!(broker.connection_count(), 1);
        assert_eq!(bus.subscribe().await.unwrap_err(), EventBusError::Disconnected);

        // Publish connection stays usable
        assert!(bus.emit("x", None));
        assert!(eventually(|| broker.count(BrokerOp::Publish, "global-events:x") == 1).await);
    }

    #[tokio::test]
    async fn test_disconnect_reports_unsubscribe_failures() {
        let broker = MemoryBroker::new();
        let config = BusConfig::default().with_mode(SubscriptionMode::PerEvent);
        let bus = EventBus::new(broker.connect(), config).await.unwrap();
        bus.on("a", |_| {});
        bus.on("b", |_| {});
        assert!(eventually(|| bus.subscribed_events().len() == 2).await);

        let mut errors = bus.errors();
        broker.set_failing(BrokerOp::Unsubscribe, true);
        bus.disconnect().await.unwrap();

        for _ in 0..2 {
            let err = errors.try_recv().unwrap();
            assert!(matches!(err, EventBusError::Unsubscribe { .. }));
        }
        assert_eq!(bus.state(), BusState::Disconnected);
    }
}
