//! In-memory tier: a least-recently-used map bounded by payload bytes

use lru::LruCache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Computes the resident byte footprint of a payload
pub type Weigher<T> = Arc<dyn Fn(&T) -> usize + Send + Sync>;

struct Entry<T> {
    value: Arc<T>,
    size: usize,
}

struct Inner<T> {
    lru: LruCache<String, Entry<T>>,
    bytes_in_use: usize,
}

/// Size-bounded LRU cache of decoded payloads keyed by request key.
///
/// Eviction is by cumulative byte size, not entry count, and happens
/// synchronously inside [`put`](Self::put): once `put` returns, resident bytes
/// never exceed the capacity.
pub struct MemoryCache<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    weigher: Weigher<T>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T> MemoryCache<T> {
    pub fn new(capacity: usize, weigher: Weigher<T>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                bytes_in_use: 0,
            }),
            capacity,
            weigher,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Capacity as a fraction of a memory budget: `budget / divisor` bytes
    pub fn with_budget(budget: usize, divisor: usize, weigher: Weigher<T>) -> Self {
        Self::new(budget / divisor.max(1), weigher)
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a payload and mark it most recently used
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let found = self.lock().lru.get(key).map(|e| Arc::clone(&e.value));
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Look up a payload without touching recency or counters
    pub fn peek(&self, key: &str) -> Option<Arc<T>> {
        self.lock().lru.peek(key).map(|e| Arc::clone(&e.value))
    }

    /// Whether a key is resident, without touching recency or counters
    pub fn contains(&self, key: &str) -> bool {
        self.lock().lru.contains(key)
    }

    /// Insert a payload if the key is absent.
    ///
    /// The first writer for a key wins; an existing entry is never replaced.
    /// Least-recently-used entries are evicted until the new one fits. A
    /// payload larger than the whole capacity is not cached at all.
    ///
    /// Returns whether the payload was inserted.
    pub fn put(&self, key: &str, value: Arc<T>) -> bool {
        let size = (self.weigher)(&value);
        if size > self.capacity {
            debug!(key, size, capacity = self.capacity, "Payload exceeds memory capacity");
            return false;
        }

        let mut inner = self.lock();
        if inner.lru.contains(key) {
            return false;
        }

        while inner.bytes_in_use + size > self.capacity {
            match inner.lru.pop_lru() {
                Some((evicted, entry)) => {
                    inner.bytes_in_use -= entry.size;
                    debug!(key = %evicted, size = entry.size, "Evicted from memory cache");
                }
                None => break,
            }
        }

        inner.lru.put(key.to_string(), Entry { value, size });
        inner.bytes_in_use += size;
        true
    }

    /// Remove a single entry
    pub fn remove(&self, key: &str) -> Option<Arc<T>> {
        let mut inner = self.lock();
        let entry = inner.lru.pop(key)?;
        inner.bytes_in_use -= entry.size;
        Some(entry.value)
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.lru.clear();
        inner.bytes_in_use = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently accounted to resident entries
    pub fn size(&self) -> usize {
        self.lock().bytes_in_use
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
