//! Public entry point tying the cache tiers and the fetch pipeline together

use crate::config::{resolve_cache_dir, LoaderConfig, CACHE_UNIQUE_NAME};
use crate::coordinator::{CoordinatorParts, DiskHandle, FetchCoordinator};
use crate::decode::Decoder;
use crate::error::{LoadError, Result};
use crate::hasher::KeyHasher;
use crate::memory::{MemoryCache, Weigher};
use crate::notifier::Notifier;
use crate::transport::Transport;
use crate::types::{CacheStats, Counters};
use crate::waiters::{Consumer, WaiterRegistry};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Two-tier image loader.
///
/// `request` never blocks and never fails: the consumer is called with the
/// payload on the notifier's context once it is available, or not at all if
/// every tier fails. Requests for a key that is already being fetched join
/// the pending fetch.
pub struct Loader<D: Decoder> {
    config: LoaderConfig,
    memory: Arc<MemoryCache<D::Output>>,
    registry: Arc<WaiterRegistry<D::Output>>,
    notifier: Arc<dyn Notifier>,
    coordinator: FetchCoordinator<D>,
}

impl<D: Decoder> Loader<D> {
    /// Open the disk store and build the loader.
    ///
    /// Must be called from within a tokio runtime, which then hosts the
    /// fetch tasks. `request` itself may be called from any thread.
    pub async fn open(
        config: LoaderConfig,
        transport: Arc<dyn Transport>,
        decoder: D,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let directory = resolve_cache_dir(config.cache_dir.as_deref(), CACHE_UNIQUE_NAME);
        let disk = DiskHandle::open(directory.clone(), config.disk_version, config.disk_max_size)
            .await?;

        let decoder = Arc::new(decoder);
        let sizing = Arc::clone(&decoder);
        let weigher: Weigher<D::Output> =
            Arc::new(move |payload: &D::Output| sizing.byte_size(payload));
        let memory = Arc::new(MemoryCache::with_budget(
            config.memory_budget,
            config.memory_fraction,
            weigher,
        ));
        let registry = Arc::new(WaiterRegistry::new());

        let coordinator = FetchCoordinator::new(CoordinatorParts {
            memory: Arc::clone(&memory),
            registry: Arc::clone(&registry),
            notifier: Arc::clone(&notifier),
            disk,
            hasher: KeyHasher::from_name(&config.hash_algorithm),
            transport,
            decoder,
            pool_size: config.pool_size,
            runtime: Handle::current(),
        });

        info!(
            directory = ?directory,
            memory_capacity = memory.capacity(),
            disk_max_size = config.disk_max_size,
            pool_size = config.pool_size,
            "Image loader ready"
        );

        Ok(Self {
            config,
            memory,
            registry,
            notifier,
            coordinator,
        })
    }

    /// Deliver the payload for `key` to `consumer`.
    ///
    /// A memory hit is delivered right away through the notifier. Otherwise
    /// the consumer waits on the key's fetch, started here if none is in
    /// flight. Empty keys are ignored.
    pub fn request(&self, key: &str, consumer: Consumer<D::Output>) {
        if key.is_empty() {
            debug!("Ignoring request with empty key");
            return;
        }

        if let Some(payload) = self.memory.get(key) {
            debug!(key, "Memory cache hit");
            self.notifier.post(Box::new(move || consumer.deliver(payload)));
            return;
        }

        debug!(key, "Memory cache miss");
        self.coordinator.ensure_fetch(key, consumer);
    }

    /// Resolve `key` and wait for the payload, up to the configured timeout.
    ///
    /// Deliveries go through the notifier like any other, so with a
    /// queue-based notifier the queue must be driven while this waits.
    pub async fn load(&self, key: &str) -> std::result::Result<Arc<D::Output>, LoadError> {
        if key.is_empty() {
            return Err(LoadError::EmptyKey);
        }

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let consumer = Consumer::listener(move |payload| {
            if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(payload);
            }
        });
        let id = consumer.id();
        self.request(key, consumer);

        match tokio::time::timeout(self.config.load_timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            // The listener was dropped undelivered by a cancel-all
            Ok(Err(_)) => Err(LoadError::Cancelled),
            Err(_) => {
                self.registry.unregister(key, id);
                debug!(key, timeout = ?self.config.load_timeout, "Load timed out");
                Err(LoadError::Timeout)
            }
        }
    }

    /// Cancel every pending fetch and forget every waiting consumer.
    ///
    /// Partially written disk entries are discarded, nothing else on disk
    /// is touched.
    pub fn cancel_all_tasks(&self) {
        self.coordinator.cancel_all();
    }

    /// Persist the disk index on the blocking pool. Failures are logged,
    /// not returned.
    ///
    /// Returns immediately. The handle resolves once the index has been
    /// synced, for callers that need to wait, e.g. at shutdown.
    pub fn flush(&self) -> JoinHandle<()> {
        let store = self.coordinator.shared().disk.current();
        self.coordinator.runtime().spawn_blocking(move || {
            if let Err(e) = store.flush() {
                warn!(error = %e, "Failed to flush disk cache");
            }
        })
    }

    /// Flush and close the disk store. It is reopened by the next fetch.
    pub fn close(&self) -> Result<()> {
        self.coordinator.shared().disk.current().close()
    }

    pub fn stats(&self) -> CacheStats {
        let shared = self.coordinator.shared();
        let store = shared.disk.current();
        let counters = &shared.counters;
        CacheStats {
            memory_entries: self.memory.len(),
            memory_bytes: self.memory.size(),
            memory_capacity: self.memory.capacity(),
            memory_hits: self.memory.hits(),
            memory_misses: self.memory.misses(),
            disk_entries: store.len(),
            disk_bytes: store.size(),
            disk_hits: Counters::get(&counters.disk_hits),
            network_fetches: Counters::get(&counters.network_fetches),
            failures: Counters::get(&counters.failures),
            cancellations: Counters::get(&counters.cancellations),
            in_flight: self.coordinator.in_flight(),
            pending_keys: self.registry.pending_keys(),
        }
    }

    pub fn memory(&self) -> &MemoryCache<D::Output> {
        &self.memory
    }

    /// Name of the disk entry backing `key`
    pub fn disk_key(&self, key: &str) -> String {
        self.coordinator.shared().hasher.hash(key)
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.coordinator.is_in_flight(key)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}
