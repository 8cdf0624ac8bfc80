//! Listener registries keyed by event name.
//!
//! Persistent and one-shot handlers live in two parallel tables. Emitting
//! snapshots the persistent handlers, drains the one-shot ones, and invokes
//! them outside the lock, so handlers may register or remove listeners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type Handler<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Handle returned by `on`/`once`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Reserved event names.
pub mod names {
    pub const DATA: &str = "data";
    pub const FILE: &str = "file";
    pub const FILE_STREAM: &str = "fileStream";
    pub const CONNECTION_CLOSED: &str = "connectionClosed";
    pub const DATA_TIMED_OUT: &str = "dataTimedOut";
    pub const ERROR: &str = "error";

    pub const CONNECTED: &str = "connected";
    pub const CONNECTION_REQUEST: &str = "connectionRequest";
    pub const CONNECTION_FAILED: &str = "connectionFailed";

    /// Session events produced locally rather than by the remote peer.
    pub const SESSION_RESERVED: [&str; 6] =
        [DATA, FILE, FILE_STREAM, CONNECTION_CLOSED, DATA_TIMED_OUT, ERROR];

    pub fn is_session_reserved(event: &str) -> bool {
        SESSION_RESERVED.contains(&event)
    }
}

struct Registry<E> {
    next_id: u64,
    persistent: HashMap<String, Vec<(ListenerId, Handler<E>)>>,
    once: HashMap<String, Vec<(ListenerId, Handler<E>)>>,
}

pub struct Listeners<E> {
    registry: Mutex<Registry<E>>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 0,
                persistent: HashMap::new(),
                once: HashMap::new(),
            }),
        }
    }

    pub fn on<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = registry.allocate();
        registry
            .persistent
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Register a handler that is removed after its first invocation.
    pub fn once<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = registry.allocate();
        registry
            .once
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a listener. Unknown ids are ignored; returns whether one was removed.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut registry = self.lock();
        let registry = &mut *registry;
        let removed = [&mut registry.persistent, &mut registry.once]
            .into_iter()
            .any(|table| remove_from(table, event, id));
        if !removed {
            tracing::debug!(event, "off() for a listener that is not registered");
        }
        removed
    }

    /// Number of listeners currently registered for `event`.
    pub fn count(&self, event: &str) -> usize {
        let registry = self.lock();
        registry.persistent.get(event).map_or(0, Vec::len) + registry.once.get(event).map_or(0, Vec::len)
    }

    /// Snapshot the handlers for one emission. One-shot handlers are
    /// consumed by this call.
    pub fn take_handlers(&self, event: &str) -> Vec<Handler<E>> {
        let mut registry = self.lock();
        let mut handlers: Vec<Handler<E>> = registry
            .persistent
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        if let Some(once) = registry.once.remove(event) {
            handlers.extend(once.into_iter().map(|(_, h)| h));
        }
        handlers
    }

    /// Invoke every handler for `event`, building a fresh payload for each.
    /// Returns the number of handlers invoked.
    pub fn emit_with(&self, event: &str, mut payload: impl FnMut() -> E) -> usize {
        let handlers = self.take_handlers(event);
        for handler in &handlers {
            handler(payload());
        }
        handlers.len()
    }

    pub fn clear(&self) {
        let mut registry = self.lock();
        registry.persistent.clear();
        registry.once.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Clone> Listeners<E> {
    pub fn emit(&self, event: &str, payload: E) -> usize {
        self.emit_with(event, || payload.clone())
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Registry<E> {
    fn allocate(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

fn remove_from<E>(
    table: &mut HashMap<String, Vec<(ListenerId, Handler<E>)>>,
    event: &str,
    id: ListenerId,
) -> bool {
    let Some(list) = table.get_mut(event) else {
        return false;
    };
    let before = list.len();
    list.retain(|(existing, _)| *existing != id);
    let removed = list.len() != before;
    if list.is_empty() {
        table.remove(event);
    }
    removed
}
