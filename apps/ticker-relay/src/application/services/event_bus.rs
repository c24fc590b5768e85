//! Event Bus
//!
//! In-process publish/subscribe surface over [`ClientEvent`]s.
//!
//! Every emission is delivered synchronously, first to observers of the
//! event's own name in registration order, then to wildcard (`*`)
//! observers in registration order. A panicking observer is logged and
//! skipped; it never blocks later observers or poisons the registry.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::domain::events::{ClientEvent, names};

type Observer = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Handle returned on registration, used to remove an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Typed observer registry.
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<HashMap<String, Vec<(ObserverId, Observer)>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let observers = self.observers.read();
        f.debug_struct("EventBus")
            .field("channels", &observers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` for events named `event` (`"*"` for all).
    pub fn on<F>(&self, event: &str, observer: F) -> ObserverId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(observer)));
        id
    }

    /// Register `observer` on the wildcard channel.
    pub fn on_any<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.on(names::WILDCARD, observer)
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn off(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        for list in observers.values_mut() {
            if let Some(pos) = list.iter().position(|(oid, _)| *oid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of observers on `event` (wildcard observers not included).
    #[must_use]
    pub fn observer_count(&self, event: &str) -> usize {
        self.observers.read().get(event).map_or(0, Vec::len)
    }

    /// Deliver `event` to its specific observers, then to wildcard observers.
    pub fn emit(&self, event: &ClientEvent) {
        // Snapshot so observers may (un)register without deadlocking.
        let (specific, wildcard) = {
            let observers = self.observers.read();
            let snapshot = |name: &str| -> Vec<Observer> {
                observers
                    .get(name)
                    .map(|list| list.iter().map(|(_, o)| Arc::clone(o)).collect())
                    .unwrap_or_default()
            };
            let specific = if event.event == names::WILDCARD {
                Vec::new()
            } else {
                snapshot(&event.event)
            };
            (specific, snapshot(names::WILDCARD))
        };

        for observer in specific.iter().chain(wildcard.iter()) {
            if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                tracing::error!(event = %event.event, "Event observer panicked");
            }
        }
    }
}
