//! End-to-end tests for buses sharing one broker.
//!
//! Each fixture attaches several buses to a single `MemoryBroker`, the way
//! separate processes attach to one Redis server, and checks what crosses
//! between them:
//! 1. Emit on one bus reaches listeners on another, marked remote
//! 2. Local-only and remote-only emits
//! 3. Per-event subscriptions following listeners
//! 4. Prefix isolation
//! 5. Error reporting for undecodable messages

use global_events::broker::memory::{BrokerOp, MemoryBroker};
use global_events::{
    BrokerConnection, BusConfig, BusState, EmitOptions, EventBus, EventBusError, EventMessage,
    Origin, SubscriptionMode,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Broker shared by every bus in a test.
struct TestFixture {
    broker: MemoryBroker,
}

impl TestFixture {
    fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
        }
    }

    /// Attach a bus and wait for its auto-subscribe.
    async fn bus(&self, config: BusConfig) -> EventBus {
        let bus = EventBus::new(self.broker.connect(), config).await.unwrap();
        assert!(eventually(|| bus.state() == BusState::Subscribed).await);
        bus
    }

    async fn wildcard(&self) -> EventBus {
        self.bus(BusConfig::default()).await
    }

    async fn per_event(&self) -> EventBus {
        self.bus(BusConfig::default().with_mode(SubscriptionMode::PerEvent))
            .await
    }
}

/// Poll `condition` until it holds; `false` after two seconds.
async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    true
}

/// Let spawned tasks run before asserting that something did not happen.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

type Seen = Arc<Mutex<Vec<EventMessage>>>;

fn record(bus: &EventBus, event: &str) -> Seen {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.on(event, move |msg: &EventMessage| sink.lock().unwrap().push(msg.clone()));
    seen
}

fn origins(seen: &Seen) -> Vec<Origin> {
    seen.lock().unwrap().iter().map(|m| m.origin).collect()
}

fn len(seen: &Seen) -> usize {
    seen.lock().unwrap().len()
}

#[tokio::test]
async fn test_emit_reaches_other_bus_as_remote() {
    let fixture = TestFixture::new();
    let a = fixture.wildcard().await;
    let b = fixture.wildcard().await;
    assert_eq!(a.prefix(), "global-");
    assert_eq!(a.state(), BusState::Subscribed);

    let on_a = record(&a, "evt");
    let on_b = record(&b, "evt");

    assert!(a.emit("evt", Some(json!({"x": 1}))));
    assert!(eventually(|| len(&on_b) == 1 && len(&on_a) == 2).await);

    let received = on_b.lock().unwrap().clone();
    assert_eq!(received[0].event, "evt");
    assert_eq!(received[0].data, json!({"x": 1}));
    assert_eq!(received[0].origin, Origin::Remote);

    // Redis-style self echo: A hears itself locally, then from the broker
    assert_eq!(origins(&on_a), vec![Origin::Local, Origin::Remote]);

    // Inbound events are never published again
    settle().await;
    assert_eq!(fixture.broker.count(BrokerOp::Publish, "global-events:evt"), 1);
    assert_eq!(b.stats().events_received, 1);
    assert_eq!(b.stats().events_published, 0);
}

#[tokio::test]
async fn test_emit_without_data_sends_sentinel() {
    let fixture = TestFixture::new();
    let a = fixture.wildcard().await;
    let b = fixture.wildcard().await;
    let on_b = record(&b, "ping");

    a.emit("ping", None);
    assert!(eventually(|| len(&on_b) == 1).await);
    assert_eq!(on_b.lock().unwrap()[0].data, json!(1));
}

#[tokio::test]
async fn test_local_only_and_remote_only() {
    let fixture = TestFixture::new();
    let a = fixture.wildcard().await;
    let b = fixture.wildcard().await;
    let on_a = record(&a, "evt");
    let on_b = record(&b, "evt");

    // Local-only spawns nothing
    a.emit_with("evt", Some(json!("local")), EmitOptions::local_only());
    assert_eq!(origins(&on_a), vec![Origin::Local]);
    assert_eq!(fixture.broker.count_op(BrokerOp::Publish), 0);
    assert!(on_b.lock().unwrap().is_empty());

    on_a.lock().unwrap().clear();
    a.emit_with("evt", Some(json!("remote")), EmitOptions::remote_only());
    assert!(on_a.lock().unwrap().is_empty());
    assert!(eventually(|| len(&on_a) == 1 && len(&on_b) == 1).await);
    assert_eq!(origins(&on_a), vec![Origin::Remote]);
    assert_eq!(origins(&on_b), vec![Origin::Remote]);
}

#[tokio::test]
async fn test_emit_async_counts_subscribers() {
    let fixture = TestFixture::new();
    let a = fixture.wildcard().await;
    let _b = fixture.wildcard().await;
    let _c = fixture.per_event().await;

    let receivers = a.emit_async("evt", None, EmitOptions::default()).await.unwrap();
    assert_eq!(receivers, 2);
}

#[tokio::test]
async fn test_per_event_bus_only_hears_listened_events() {
    let fixture = TestFixture::new();
    let a = fixture.wildcard().await;
    let b = fixture.per_event().await;
    assert!(!b.is_subscribed());

    // Nobody holds "global-events:x" except A's pattern
    let receivers = a.emit_async("x", Some(json!("early")), EmitOptions::default()).await.unwrap();
    assert_eq!(receivers, 1);
    assert_eq!(b.stats().events_received, 0);

    let on_b = record(&b, "x");
    assert!(eventually(|| b.tracker().covers("x")).await);
    assert_eq!(b.subscribed_events(), vec!["x".to_string()]);
    assert_eq!(fixture.broker.count(BrokerOp::Subscribe, "global-events:x"), 1);

    a.emit_async("y", Some(json!("ignored")), EmitOptions::default()).await.unwrap();
    a.emit_async("x", Some(json!("late")), EmitOptions::default()).await.unwrap();
    let received = on_b.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].data, json!("late"));
    assert_eq!(b.stats().events_received, 1);

    b.remove_all_listeners(None);
    assert!(eventually(|| !b.is_subscribed()).await);
    assert_eq!(fixture.broker.count(BrokerOp::Unsubscribe, "global-events:x"), 1);
}

#[tokio::test]
async fn test_once_across_buses() {
    let fixture = TestFixture::new();
    let a = fixture.wildcard().await;
    let b = fixture.per_event().await;

    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    b.once("job", move |_: &EventMessage| *counter.lock().unwrap() += 1);
    assert!(eventually(|| b.tracker().covers("job")).await);

    a.emit_async("job", None, EmitOptions::default()).await.unwrap();
    a.emit("job", None);

    assert!(eventually(|| !b.tracker().covers("job")).await);
    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(fixture.broker.count(BrokerOp::Unsubscribe, "global-events:job"), 1);
}

#[tokio::test]
async fn test_prefixes_are_isolated() {
    let fixture = TestFixture::new();
    let a = fixture.wildcard().await;
    let other = fixture.bus(BusConfig::default().with_prefix("other-")).await;
    let on_other = record(&other, "evt");

    // Only A's own pattern matches
    let receivers = a.emit_async("evt", None, EmitOptions::default()).await.unwrap();
    assert_eq!(receivers, 1);
    assert!(on_other.lock().unwrap().is_empty());

    other.emit("evt", None);
    assert!(eventually(|| len(&on_other) == 2).await);
    assert_eq!(fixture.broker.count(BrokerOp::Publish, "other-events:evt"), 1);
}

#[tokio::test]
async fn test_resubscribe_does_not_duplicate_delivery() {
    let fixture = TestFixture::new();
    let a = fixture.wildcard().await;
    let b = fixture.wildcard().await;
    let on_b = record(&b, "evt");

    b.unsubscribe().await.unwrap();
    a.emit_async("evt", None, EmitOptions::default()).await.unwrap();
    assert!(on_b.lock().unwrap().is_empty());

    b.subscribe().await.unwrap();
    b.unsubscribe().await.unwrap();
    b.subscribe().await.unwrap();
    a.emit_async("evt", None, EmitOptions::default()).await.unwrap();
    assert_eq!(len(&on_b), 1);
}

#[tokio::test]
async fn test_undecodable_message_is_reported() {
    let fixture = TestFixture::new();
    let b = fixture.wildcard().await;
    let on_b = record(&b, "evt");
    let mut errors = b.errors();

    // 0xc1 is never valid MessagePack
    let raw = fixture.broker.connect();
    raw.publish("global-events:evt", vec![0xc1]).await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(1), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, EventBusError::Codec(_)));
    assert!(on_b.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_msgpack_payload_from_another_process() {
    let fixture = TestFixture::new();
    let b = fixture.wildcard().await;
    let on_b = record(&b, "evt");

    // {"id": 7} as a MessagePack fixmap
    let raw = fixture.broker.connect();
    raw.publish("global-events:evt", vec![0x81, 0xa2, b'i', b'd', 0x07])
        .await
        .unwrap();

    assert_eq!(on_b.lock().unwrap()[0].data, json!({"id": 7}));
}

#[tokio::test]
async fn test_disconnected_bus_stops_receiving() {
    let fixture = TestFixture::new();
    let a = fixture.wildcard().await;
    let b = fixture.wildcard().await;
    let on_b = record(&b, "evt");

    b.disconnect().await.unwrap();
    assert_eq!(b.state(), BusState::Disconnected);

    let receivers = a.emit_async("evt", None, EmitOptions::default()).await.unwrap();
    assert_eq!(receivers, 1);
    assert!(on_b.lock().unwrap().is_empty());

    // Listeners still work locally
    b.emit_with("evt", None, EmitOptions::local_only());
    assert_eq!(origins(&on_b), vec![Origin::Local]);
}
