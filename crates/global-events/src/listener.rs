//! Local listener registry.
//!
//! An ordered multi-map from event name to callbacks. Every mutation
//! reports whether the event went from zero listeners to some or from some
//! to zero, which is what drives per-event broker subscriptions.

use crate::types::EventMessage;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Callback invoked for every dispatched event.
pub type Listener = Arc<dyn Fn(&EventMessage) + Send + Sync>;

/// Handle returned when registering a listener; used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Raw numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Clone)]
struct Entry {
    id: ListenerId,
    callback: Listener,
    once: bool,
}

/// Snapshot of one registered listener, taken for dispatch.
#[derive(Clone)]
pub struct RegisteredListener {
    /// Listener handle
    pub id: ListenerId,
    /// Callback
    pub callback: Listener,
    /// Removed after first invocation
    pub once: bool,
}

/// Where a new listener goes in the event's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// After existing listeners
    Append,
    /// Before existing listeners
    Prepend,
}

/// Ordered event → listeners map.
#[derive(Default)]
pub struct ListenerRegistry {
    events: HashMap<String, Vec<Entry>>,
    next_id: u64,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> = self
            .events
            .iter()
            .map(|(event, entries)| (event.as_str(), entries.len()))
            .collect();
        f.debug_struct("ListenerRegistry")
            .field("events", &counts)
            .finish()
    }
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register callbacks for an event.
    ///
    /// Returns the new ids in the order the callbacks were given, and
    /// whether the event had no listeners before. With
    /// [`Placement::Prepend`] the callbacks keep their relative order and
    /// all go before existing listeners.
    pub fn add(
        &mut self,
        event: &str,
        callbacks: Vec<Listener>,
        placement: Placement,
        once: bool,
    ) -> (Vec<ListenerId>, bool) {
        let entries: Vec<Entry> = callbacks
            .into_iter()
            .map(|callback| {
                self.next_id += 1;
                Entry {
                    id: ListenerId(self.next_id),
                    callback,
                    once,
                }
            })
            .collect();
        let ids = entries.iter().map(|e| e.id).collect();

        let list = self.events.entry(event.to_string()).or_default();
        let was_empty = list.is_empty();
        match placement {
            Placement::Append => list.extend(entries),
            Placement::Prepend => {
                list.splice(0..0, entries);
            }
        }
        if list.is_empty() {
            self.events.remove(event);
        }

        (ids, was_empty)
    }

    /// Remove listeners by id.
    ///
    /// Returns how many were removed and whether the event is now without
    /// listeners (only `true` if something was removed).
    pub fn remove(&mut self, event: &str, ids: &[ListenerId]) -> (usize, bool) {
        let Some(list) = self.events.get_mut(event) else {
            return (0, false);
        };

        let before = list.len();
        list.retain(|entry| !ids.contains(&entry.id));
        let removed = before - list.len();

        let now_empty = list.is_empty();
        if now_empty {
            self.events.remove(event);
        }

        (removed, removed > 0 && now_empty)
    }

    /// Remove every listener of an event, returning how many there were.
    pub fn clear_event(&mut self, event: &str) -> usize {
        self.events.remove(event).map(|list| list.len()).unwrap_or(0)
    }

    /// Remove every listener, returning the events that had any.
    pub fn clear(&mut self) -> Vec<String> {
        let mut events: Vec<String> = self.events.drain().map(|(event, _)| event).collect();
        events.sort();
        events
    }

    /// Listeners of an event in dispatch order.
    pub fn snapshot(&self, event: &str) -> Vec<RegisteredListener> {
        self.events
            .get(event)
            .map(|list| {
                list.iter()
                    .map(|entry| RegisteredListener {
                        id: entry.id,
                        callback: entry.callback.clone(),
                        once: entry.once,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of listeners for an event.
    pub fn listener_count(&self, event: &str) -> usize {
        self.events.get(event).map(Vec::len).unwrap_or(0)
    }

    /// Events with at least one listener, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut events: Vec<String> = self.events.keys().cloned().collect();
        events.sort();
        events
    }

    /// Whether any listener is registered.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
