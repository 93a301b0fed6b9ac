//! Consumers awaiting a payload, grouped per request key

use crate::notifier::Notifier;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// A visual surface that displays a payload. Implemented by the UI layer.
pub trait ImageTarget<T>: Send + Sync {
    fn set_image(&self, image: Arc<T>);
}

type Callback<T> = Arc<dyn Fn(Arc<T>) + Send + Sync>;

enum Kind<T> {
    View(Arc<dyn ImageTarget<T>>),
    Listener { id: u64, callback: Callback<T> },
}

/// Identity used to deduplicate registrations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerId {
    /// Address of the view: one registration per view and key
    View(usize),
    /// Unique per listener, shared by its clones
    Listener(u64),
}

/// Something that accepts a completed payload.
///
/// Two kinds share the same registry and drain protocol: a view binding and
/// a callback listener. Clones of a consumer are the same consumer.
pub struct Consumer<T> {
    kind: Kind<T>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        let kind = match &self.kind {
            Kind::View(target) => Kind::View(Arc::clone(target)),
            Kind::Listener { id, callback } => Kind::Listener {
                id: *id,
                callback: Arc::clone(callback),
            },
        };
        Self { kind }
    }
}

impl<T> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Consumer").field(&self.id()).finish()
    }
}

impl<T> Consumer<T> {
    pub fn view(target: Arc<dyn ImageTarget<T>>) -> Self {
        Self {
            kind: Kind::View(target),
        }
    }

    pub fn listener<F>(callback: F) -> Self
    where
        F: Fn(Arc<T>) + Send + Sync + 'static,
    {
        Self {
            kind: Kind::Listener {
                id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
                callback: Arc::new(callback),
            },
        }
    }

    pub fn id(&self) -> ConsumerId {
        match &self.kind {
            Kind::View(target) => ConsumerId::View(Arc::as_ptr(target) as *const () as usize),
            Kind::Listener { id, .. } => ConsumerId::Listener(*id),
        }
    }

    pub fn deliver(&self, image: Arc<T>) {
        match &self.kind {
            Kind::View(target) => target.set_image(image),
            Kind::Listener { callback, .. } => callback(image),
        }
    }
}

/// Per-key, insertion-ordered, deduplicated sets of waiting consumers
pub struct WaiterRegistry<T> {
    waiters: Mutex<HashMap<String, Vec<Consumer<T>>>>,
}

impl<T> Default for WaiterRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaiterRegistry<T> {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Consumer<T>>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a consumer to the key's set. Returns `false` if it was already there.
    pub fn register(&self, key: &str, consumer: Consumer<T>) -> bool {
        let mut waiters = self.lock();
        let set = waiters.entry(key.to_string()).or_default();
        let id = consumer.id();
        if set.iter().any(|c| c.id() == id) {
            return false;
        }
        set.push(consumer);
        true
    }

    /// Remove one consumer, dropping the key's set if it becomes empty
    pub fn unregister(&self, key: &str, id: ConsumerId) -> bool {
        let mut waiters = self.lock();
        let Some(set) = waiters.get_mut(key) else {
            return false;
        };
        let before = set.len();
        set.retain(|c| c.id() != id);
        let removed = set.len() != before;
        if set.is_empty() {
            waiters.remove(key);
        }
        removed
    }

    /// Atomically remove and return every consumer waiting on `key`
    pub fn take(&self, key: &str) -> Vec<Consumer<T>> {
        self.lock().remove(key).unwrap_or_default()
    }

    /// Take the key's waiters and deliver `payload` to each of them as a
    /// single delivery on the notifier's context. Returns how many were served.
    pub fn drain_and_notify(&self, key: &str, payload: Arc<T>, notifier: &dyn Notifier) -> usize
    where
        T: Send + Sync + 'static,
    {
        let consumers = self.take(key);
        let count = consumers.len();
        if count == 0 {
            return 0;
        }
        debug!(key, waiters = count, "Draining waiters");
        notifier.post(Box::new(move || {
            for consumer in consumers {
                consumer.deliver(Arc::clone(&payload));
            }
        }));
        count
    }

    /// Drop every waiter set. Returns how many consumers were discarded.
    pub fn clear(&self) -> usize {
        let mut waiters = self.lock();
        let count = waiters.values().map(Vec::len).sum();
        waiters.clear();
        count
    }

    pub fn waiter_count(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, Vec::len)
    }

    /// Number of keys with at least one waiter
    pub fn pending_keys(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_keys() == 0
    }
}
