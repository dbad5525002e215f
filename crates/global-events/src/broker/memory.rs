//! In-process broker.
//!
//! `MemoryBroker` mimics Redis pub/sub semantics inside a single process:
//! exact and glob-pattern subscriptions per connection, receiver counts on
//! publish, and delivery to every subscribed connection including the
//! publisher's own. It is suitable for single-process apps and testing; it
//! also records every command it receives and can be told to fail commands
//! or withhold readiness.
//!
//! # Example
//!
//! ```rust,no_run
//! use global_events::broker::memory::MemoryBroker;
//! use global_events::{BusConfig, EventBus};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!     let bus = EventBus::new(broker.connect(), BusConfig::default()).await?;
//!     bus.emit("ping", None);
//!     Ok(())
//! }
//! ```

use super::{BrokerConnection, MessageHandler};
use crate::error::{EventBusError, EventBusResult};
use crate::types::ConnectionStatus;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

/// Kind of command a connection sent to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    /// PUBLISH
    Publish,
    /// SUBSCRIBE
    Subscribe,
    /// UNSUBSCRIBE
    Unsubscribe,
    /// PSUBSCRIBE
    PSubscribe,
    /// PUNSUBSCRIBE
    PUnsubscribe,
}

/// A command received by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCall {
    /// Connection that sent the command
    pub connection: u64,
    /// Command kind
    pub op: BrokerOp,
    /// Channel or pattern
    pub target: String,
}

/// Per-connection subscription state held by the broker.
struct ConnectionState {
    id: u64,
    channels: Mutex<HashSet<String>>,
    patterns: Mutex<HashSet<String>>,
    handlers: RwLock<Vec<MessageHandler>>,
    status: watch::Sender<ConnectionStatus>,
}

impl ConnectionState {
    fn is_ready(&self) -> bool {
        *self.status.borrow() == ConnectionStatus::Ready
    }
}

struct BrokerCore {
    connections: RwLock<HashMap<u64, Arc<ConnectionState>>>,
    next_id: AtomicU64,
    status: Mutex<ConnectionStatus>,
    calls: Mutex<Vec<BrokerCall>>,
    failing: Mutex<HashSet<BrokerOp>>,
}

/// In-process publish/subscribe broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    core: Arc<BrokerCore>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("connections", &self.connection_count())
            .field("status", &self.status())
            .finish()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a broker whose connections are immediately ready.
    pub fn new() -> Self {
        Self::with_status(ConnectionStatus::Ready)
    }

    /// Create a broker whose connections start in the given status.
    pub fn with_status(status: ConnectionStatus) -> Self {
        Self {
            core: Arc::new(BrokerCore {
                connections: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                status: Mutex::new(status),
                calls: Mutex::new(Vec::new()),
                failing: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Open a new connection.
    pub fn connect(&self) -> Arc<MemoryConnection> {
        Arc::new(self.open())
    }

    fn open(&self) -> MemoryConnection {
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        let (status, _) = watch::channel(self.status());
        let state = Arc::new(ConnectionState {
            id,
            channels: Mutex::new(HashSet::new()),
            patterns: Mutex::new(HashSet::new()),
            handlers: RwLock::new(Vec::new()),
            status,
        });

        if let Ok(mut connections) = self.core.connections.write() {
            connections.insert(id, state.clone());
        }

        MemoryConnection {
            core: self.core.clone(),
            state,
        }
    }

    /// Broker-wide readiness applied to new connections.
    pub fn status(&self) -> ConnectionStatus {
        self.core
            .status
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Change readiness of the broker and every open connection.
    pub fn set_status(&self, status: ConnectionStatus) {
        if let Ok(mut current) = self.core.status.lock() {
            *current = status;
        }
        for state in self.open_connections() {
            state.status.send_replace(status);
        }
    }

    /// Make every subsequent command of `op` fail (or succeed again).
    pub fn set_failing(&self, op: BrokerOp, failing: bool) {
        if let Ok(mut set) = self.core.failing.lock() {
            if failing {
                set.insert(op);
            } else {
                set.remove(&op);
            }
        }
    }

    /// Every command received so far, in order.
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.core
            .calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Number of commands of `op` targeting `target`.
    pub fn count(&self, op: BrokerOp, target: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.op == op && c.target == target)
            .count()
    }

    /// Number of commands of `op` for any target.
    pub fn count_op(&self, op: BrokerOp) -> usize {
        self.calls().iter().filter(|c| c.op == op).count()
    }

    /// Forget recorded commands.
    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.core.calls.lock() {
            calls.clear();
        }
    }

    /// Number of connections that have not been disconnected.
    pub fn connection_count(&self) -> usize {
        self.core
            .connections
            .read()
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Number of subscribers (exact + pattern) a publish on `channel` would reach.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.open_connections()
            .iter()
            .map(|state| matching_subscriptions(state, channel))
            .sum()
    }

    fn open_connections(&self) -> Vec<Arc<ConnectionState>> {
        self.core
            .connections
            .read()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Number of this connection's subscriptions matching a channel.
fn matching_subscriptions(state: &ConnectionState, channel: &str) -> usize {
    let exact = state
        .channels
        .lock()
        .map(|c| usize::from(c.contains(channel)))
        .unwrap_or(0);
    let patterns = state
        .patterns
        .lock()
        .map(|p| p.iter().filter(|pattern| glob_matches(pattern, channel)).count())
        .unwrap_or(0);
    exact + patterns
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    core: Arc<BrokerCore>,
    state: Arc<ConnectionState>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.state.id)
            .field("status", &*self.state.status.borrow())
            .finish()
    }
}

impl MemoryConnection {
    /// Broker-assigned connection id (as recorded in [`BrokerCall`]).
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Change readiness of this connection only.
    pub fn set_status(&self, status: ConnectionStatus) {
        self.state.status.send_replace(status);
    }

    /// Channels this connection is subscribed to.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .state
            .channels
            .lock()
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Patterns this connection is subscribed to.
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .state
            .patterns
            .lock()
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default();
        patterns.sort();
        patterns
    }

    /// Record a command, rejecting it if the connection is not ready or the
    /// broker was told to fail this kind of command.
    fn command(&self, op: BrokerOp, target: &str) -> Result<(), String> {
        if !self.state.is_ready() {
            return Err(NOT_READY.to_string());
        }

        if let Ok(mut calls) = self.core.calls.lock() {
            calls.push(BrokerCall {
                connection: self.state.id,
                op,
                target: target.to_string(),
            });
        }

        let failing = self
            .core
            .failing
            .lock()
            .map(|f| f.contains(&op))
            .unwrap_or(false);
        if failing {
            return Err(format!("{:?} rejected by broker", op));
        }

        Ok(())
    }

    fn subscription_error(&self, reason: String, channel: &str, subscribe: bool) -> EventBusError {
        if reason == NOT_READY {
            return EventBusError::NotReady;
        }
        let channel = channel.to_string();
        if subscribe {
            EventBusError::Subscribe { channel, reason }
        } else {
            EventBusError::Unsubscribe { channel, reason }
        }
    }
}

const NOT_READY: &str = "connection not ready";

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> EventBusResult<u64> {
        self.command(BrokerOp::Publish, channel).map_err(|reason| {
            if reason == NOT_READY {
                EventBusError::NotReady
            } else {
                EventBusError::Publish {
                    channel: channel.to_string(),
                    reason,
                }
            }
        })?;

        // Collect deliveries first so no lock is held while handlers run
        let mut deliveries: Vec<MessageHandler> = Vec::new();
        let mut receivers = 0u64;
        let connections = self
            .core
            .connections
            .read()
            .map(|c| c.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        for state in connections {
            if !state.is_ready() {
                continue;
            }
            let matches = matching_subscriptions(&state, channel);
            if matches == 0 {
                continue;
            }
            // Counted per subscription, like Redis, whatever the handlers
            receivers += matches as u64;
            let handlers = state.handlers.read().map(|h| h.clone()).unwrap_or_default();
            for _ in 0..matches {
                deliveries.extend(handlers.iter().cloned());
            }
        }

        for handler in deliveries {
            handler(channel, &payload);
        }

        tracing::trace!(channel = %channel, receivers, "Memory broker delivered message");
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> EventBusResult<()> {
        self.command(BrokerOp::Subscribe, channel)
            .map_err(|reason| self.subscription_error(reason, channel, true))?;
        if let Ok(mut channels) = self.state.channels.lock() {
            channels.insert(channel.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> EventBusResult<()> {
        self.command(BrokerOp::Unsubscribe, channel)
            .map_err(|reason| self.subscription_error(reason, channel, false))?;
        if let Ok(mut channels) = self.state.channels.lock() {
            channels.remove(channel);
        }
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> EventBusResult<()> {
        self.command(BrokerOp::PSubscribe, pattern)
            .map_err(|reason| self.subscription_error(reason, pattern, true))?;
        if let Ok(mut patterns) = self.state.patterns.lock() {
            patterns.insert(pattern.to_string());
        }
        Ok(())
    }

    async fn punsubscribe(&self, pattern: &str) -> EventBusResult<()> {
        self.command(BrokerOp::PUnsubscribe, pattern)
            .map_err(|reason| self.subscription_error(reason, pattern, false))?;
        if let Ok(mut patterns) = self.state.patterns.lock() {
            patterns.remove(pattern);
        }
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        if let Ok(mut handlers) = self.state.handlers.write() {
            handlers.push(handler);
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.state.status.borrow()
    }

    fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.state.status.subscribe()
    }

    async fn duplicate(&self) -> EventBusResult<Arc<dyn BrokerConnection>> {
        if self.status() == ConnectionStatus::Disconnected {
            return Err(EventBusError::Connection(
                "cannot duplicate a closed connection".to_string(),
            ));
        }
        let broker = MemoryBroker {
            core: self.core.clone(),
        };
        Ok(Arc::new(broker.open()))
    }

    async fn disconnect(&self) -> EventBusResult<()> {
        if let Ok(mut connections) = self.core.connections.write() {
            connections.remove(&self.state.id);
        }
        if let Ok(mut channels) = self.state.channels.lock() {
            channels.clear();
        }
        if let Ok(mut patterns) = self.state.patterns.lock() {
            patterns.clear();
        }
        self.state.status.send_replace(ConnectionStatus::Disconnected);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Match a channel against a Redis-style glob pattern.
///
/// Supports `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\` escapes.
pub fn glob_matches(pattern: &str, channel: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let channel: Vec<char> = channel.chars().collect();
    glob_match_at(&pattern, &channel)
}

fn glob_match_at(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            // Collapse runs of '*'
            let rest = &pattern[1..];
            if rest.is_empty() {
                return true;
            }
            (0..=text.len()).any(|i| glob_match_at(rest, &text[i..]))
        }
        Some('?') => !text.is_empty() && glob_match_at(&pattern[1..], &text[1..]),
        Some('[') => {
            let Some(&c) = text.first() else {
                return false;
            };
            match match_class(&pattern[1..], c) {
                Some((matched, consumed)) => {
                    matched && glob_match_at(&pattern[1 + consumed..], &text[1..])
                }
                // Unterminated class: treat '[' literally
                None => c == '[' && glob_match_at(&pattern[1..], &text[1..]),
            }
        }
        Some('\\') if pattern.len() > 1 => {
            !text.is_empty() && text[0] == pattern[1] && glob_match_at(&pattern[2..], &text[1..])
        }
        Some(&p) => !text.is_empty() && text[0] == p && glob_match_at(&pattern[1..], &text[1..]),
    }
}

/// Evaluate a character class body (after '['). Returns whether `c`
/// matched and how many pattern chars were consumed including the ']'.
fn match_class(class: &[char], c: char) -> Option<(bool, usize)> {
    let mut i = 0;
    let negate = class.first() == Some(&'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < class.len() {
        match class[i] {
            ']' => return Some((matched != negate, i + 1)),
            '\\' if i + 1 < class.len() => {
                matched |= class[i + 1] == c;
                i += 2;
            }
            start if i + 2 < class.len() && class[i + 1] == '-' && class[i + 2] != ']' => {
                let end = class[i + 2];
                let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
                matched |= lo <= c && c <= hi;
                i += 3;
            }
            other => {
                matched |= other == c;
                i += 1;
            }
        }
    }

    None
}
