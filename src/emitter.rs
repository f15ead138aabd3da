//! Named-event publish/subscribe register.
//!
//! Connections and servers each own an [`EventEmitter`] and expose `on`,
//! `once` and `off` by delegation. Listener lifetime is controlled by the
//! caller through the [`ListenerId`] returned at registration; nothing is
//! unsubscribed behind the caller's back.
//!
//! # Example
//!
//! ```
//! use eventsock::emitter::EventEmitter;
//!
//! let emitter: EventEmitter<u32> = EventEmitter::new();
//! let id = emitter.on("tick", |event| println!("{} -> {}", event.name, event.payload));
//! emitter.on("*", |event| println!("saw {}", event.name));
//!
//! assert!(emitter.emit("tick", &1));
//! assert!(emitter.off(id));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::WILDCARD_EVENT;

/// Handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// An emitted event as seen by a listener.
///
/// Wildcard listeners get the same view, so `name` always carries the name
/// the event was emitted under.
pub struct Event<'a, T> {
    pub name: &'a str,
    pub payload: &'a T,
}

impl<T: fmt::Debug> fmt::Debug for Event<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("payload", self.payload)
            .finish()
    }
}

type Listener<T> = Arc<dyn Fn(&Event<'_, T>) + Send + Sync>;

struct Entry<T> {
    id: ListenerId,
    name: String,
    once: bool,
    listener: Listener<T>,
}

/// Thread-safe event emitter with exact-name and wildcard listeners.
pub struct EventEmitter<T> {
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register `listener` for `name`, or for every event when `name` is `"*"`.
    pub fn on<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event<'_, T>) + Send + Sync + 'static,
    {
        self.insert(name, false, Arc::new(listener))
    }

    /// Like [`on`](Self::on), but the listener is removed before it first runs.
    pub fn once<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event<'_, T>) + Send + Sync + 'static,
    {
        self.insert(name, true, Arc::new(listener))
    }

    fn insert(&self, name: &str, once: bool, listener: Listener<T>) -> ListenerId {
        let id = ListenerId::next();
        self.entries.lock().push(Entry {
            id,
            name: name.to_string(),
            once,
            listener,
        });
        id
    }

    /// Remove a listener. Returns false if it was not registered here.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub fn remove_all_listeners(&self) {
        self.entries.lock().clear();
    }

    /// Number of listeners registered under exactly `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.entries.lock().iter().filter(|e| e.name == name).count()
    }

    /// Deliver an event synchronously.
    ///
    /// Listeners for `name` run first, in registration order, then wildcard
    /// listeners. The set of listeners is fixed when `emit` is entered, so
    /// listeners may register, remove or emit without deadlocking. Returns
    /// whether any listener ran.
    pub fn emit(&self, name: &str, payload: &T) -> bool {
        let (exact, wildcard) = {
            let mut entries = self.entries.lock();
            let mut exact = Vec::new();
            let mut wildcard = Vec::new();
            entries.retain(|e| {
                let matched = if e.name == name {
                    exact.push(Arc::clone(&e.listener));
                    true
                } else if e.name == WILDCARD_EVENT {
                    wildcard.push(Arc::clone(&e.listener));
                    true
                } else {
                    false
                };
                !(matched && e.once)
            });
            (exact, wildcard)
        };

        let event = Event { name, payload };
        for listener in exact.iter().chain(wildcard.iter()) {
            listener(&event);
        }
        !(exact.is_empty() && wildcard.is_empty())
    }
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.entries.lock().len())
            .finish()
    }
}
