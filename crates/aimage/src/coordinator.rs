//! Fetch coordination: one task per request key on a bounded worker pool
//!
//! A task resolves its key disk-first, falling back to the network, which
//! populates the disk store before the value is read back. Successful
//! payloads go into the memory tier and every waiter registered for the key
//! is served with one drain. The task record is removed when the task ends
//! whatever the outcome, so the next request for a failed key starts over.

use crate::decode::Decoder;
use crate::disk::{DiskStore, Editor};
use crate::error::{FetchError, Result};
use crate::hasher::KeyHasher;
use crate::memory::MemoryCache;
use crate::notifier::Notifier;
use crate::transport::Transport;
use crate::types::Counters;
use crate::waiters::{Consumer, WaiterRegistry};
use futures::StreamExt;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Value slots per disk entry: the encoded image
pub(crate) const VALUE_COUNT: usize = 1;

/// Copy buffer for streaming network bytes into a disk entry
const DOWNLOAD_BUFFER_SIZE: usize = 8 * 1024;

/// The disk store, reopened on demand after it has been closed
pub(crate) struct DiskHandle {
    current: Mutex<DiskStore>,
    reopen: tokio::sync::Mutex<()>,
    directory: PathBuf,
    version: u32,
    max_size: u64,
}

impl DiskHandle {
    pub async fn open(directory: PathBuf, version: u32, max_size: u64) -> Result<Self> {
        let store = DiskStore::open(&directory, version, VALUE_COUNT, max_size).await?;
        Ok(Self {
            current: Mutex::new(store),
            reopen: tokio::sync::Mutex::new(()),
            directory,
            version,
            max_size,
        })
    }

    /// The store as it is now, possibly closed
    pub fn current(&self) -> DiskStore {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// An open store, reopening the directory if the last one was closed
    pub async fn get(&self) -> Result<DiskStore> {
        let store = self.current();
        if !store.is_closed() {
            return Ok(store);
        }

        let _reopening = self.reopen.lock().await;
        let store = self.current();
        if !store.is_closed() {
            return Ok(store);
        }

        info!(directory = ?self.directory, "Reopening closed disk cache");
        let store =
            DiskStore::open(&self.directory, self.version, VALUE_COUNT, self.max_size).await?;
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = store.clone();
        Ok(store)
    }
}

struct TaskRecord {
    id: u64,
    abort: AbortHandle,
    /// Set by cancellation. Checked and held across the disk commit.
    cancelled: Arc<Mutex<bool>>,
}

/// Collaborators shared between the coordinator and its tasks
pub(crate) struct Shared<D: Decoder> {
    memory: Arc<MemoryCache<D::Output>>,
    registry: Arc<WaiterRegistry<D::Output>>,
    notifier: Arc<dyn Notifier>,
    pub disk: DiskHandle,
    pub hasher: KeyHasher,
    transport: Arc<dyn Transport>,
    decoder: Arc<D>,
    pub counters: Counters,
    tasks: Mutex<HashMap<String, TaskRecord>>,
    permits: Semaphore,
}

/// Owns the task table and the worker pool
pub struct FetchCoordinator<D: Decoder> {
    shared: Arc<Shared<D>>,
    runtime: Handle,
    next_id: AtomicU64,
}

/// Everything a coordinator needs, built by the loader
pub(crate) struct CoordinatorParts<D: Decoder> {
    pub memory: Arc<MemoryCache<D::Output>>,
    pub registry: Arc<WaiterRegistry<D::Output>>,
    pub notifier: Arc<dyn Notifier>,
    pub disk: DiskHandle,
    pub hasher: KeyHasher,
    pub transport: Arc<dyn Transport>,
    pub decoder: Arc<D>,
    pub pool_size: usize,
    pub runtime: Handle,
}

impl<D: Decoder> FetchCoordinator<D> {
    pub(crate) fn new(parts: CoordinatorParts<D>) -> Self {
        let shared = Shared {
            memory: parts.memory,
            registry: parts.registry,
            notifier: parts.notifier,
            disk: parts.disk,
            hasher: parts.hasher,
            transport: parts.transport,
            decoder: parts.decoder,
            counters: Counters::default(),
            tasks: Mutex::new(HashMap::new()),
            permits: Semaphore::new(parts.pool_size.max(1)),
        };
        Self {
            shared: Arc::new(shared),
            runtime: parts.runtime,
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn shared(&self) -> &Shared<D> {
        &self.shared
    }

    /// Runtime hosting the fetch tasks
    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Register `consumer` for `key` and make sure a task will serve it.
    ///
    /// Returns `true` if this call started a new task.
    pub fn ensure_fetch(&self, key: &str, consumer: Consumer<D::Output>) -> bool {
        if !self.shared.registry.register(key, consumer) {
            debug!(key, "Consumer already waiting");
        }
        self.ensure_task(key)
    }

    fn ensure_task(&self, key: &str) -> bool {
        let mut tasks = self.shared.lock_tasks();
        if tasks.contains_key(key) {
            debug!(key, "Fetch already in flight");
            return false;
        }

        // A task may have completed between the caller's memory miss and
        // the registration above. Its payload is already resident.
        if let Some(payload) = self.shared.memory.peek(key) {
            drop(tasks);
            self.shared
                .registry
                .drain_and_notify(key, payload, self.shared.notifier.as_ref());
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(Mutex::new(false));
        let shared = Arc::clone(&self.shared);
        let gate = Arc::clone(&cancelled);
        let task_key = key.to_string();

        // The record is inserted before the lock is released, so the task
        // cannot complete without finding it.
        let handle = self.runtime.spawn(async move {
            let _guard = TaskGuard {
                shared: Arc::clone(&shared),
                key: task_key.clone(),
                id,
            };
            let outcome = Shared::resolve(&shared, &task_key, &gate).await;
            shared.complete(&task_key, id, outcome);
        });

        tasks.insert(
            key.to_string(),
            TaskRecord {
                id,
                abort: handle.abort_handle(),
                cancelled,
            },
        );
        debug!(key, task_id = id, "Fetch task submitted");
        true
    }

    /// Cancel every queued or running task and drop all waiters.
    ///
    /// Cancelled tasks neither commit their disk edit nor populate the
    /// memory tier. Returns the number of tasks cancelled.
    pub fn cancel_all(&self) -> usize {
        let records: Vec<(String, TaskRecord)> = {
            let mut tasks = self.shared.lock_tasks();
            for record in tasks.values() {
                *record.cancelled.lock().unwrap_or_else(|e| e.into_inner()) = true;
                record.abort.abort();
            }
            tasks.drain().collect()
        };
        let waiters = self.shared.registry.clear();

        let count = records.len();
        Counters::add(&self.shared.counters.cancellations, count as u64);
        info!(tasks = count, waiters, "Cancelled all fetch tasks");
        count
    }

    /// Number of tasks queued or running
    pub fn in_flight(&self) -> usize {
        self.shared.lock_tasks().len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.shared.lock_tasks().contains_key(key)
    }
}

impl<D: Decoder> Shared<D> {
    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Disk first, then network into disk, then decode
    async fn resolve(
        shared: &Arc<Self>,
        key: &str,
        cancelled: &Mutex<bool>,
    ) -> Result<Arc<D::Output>> {
        let _permit = shared
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Cancelled)?;

        let disk_key = shared.hasher.hash(key);
        let store = shared.disk.get().await?;

        let snapshot = match store.lookup(&disk_key).await? {
            Some(snapshot) => {
                debug!(key, disk_key = %disk_key, "Disk cache hit");
                Counters::incr(&shared.counters.disk_hits);
                Some(snapshot)
            }
            None => {
                match store.edit(&disk_key)? {
                    Some(editor) => {
                        Counters::incr(&shared.counters.network_fetches);
                        shared.download(key, editor, cancelled).await?;
                    }
                    None => {
                        debug!(key, disk_key = %disk_key, "Disk entry is being written elsewhere");
                    }
                }
                store.lookup(&disk_key).await?
            }
        };

        let mut snapshot = snapshot.ok_or(FetchError::NotFound)?;
        let data = snapshot.read(0).await?;

        let decoder = Arc::clone(&shared.decoder);
        let payload = tokio::task::spawn_blocking(move || decoder.decode(data))
            .await
            .map_err(|e| FetchError::Io(Box::new(io::Error::other(e))))??;
        Ok(Arc::new(payload))
    }

    /// Stream the network body into `editor`, committing only a complete
    /// transfer of a task that has not been cancelled
    async fn download(&self, key: &str, mut editor: Editor, cancelled: &Mutex<bool>) -> Result<()> {
        debug!(key, disk_key = %editor.key(), "Downloading");

        let transfer = async {
            let mut stream = self.transport.fetch(key).await?;
            let file = editor.new_output(0).await?;
            let mut out = BufWriter::with_capacity(DOWNLOAD_BUFFER_SIZE, file);
            let mut total = 0usize;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                total += chunk.len();
                out.write_all(&chunk).await?;
            }
            out.flush().await?;
            Ok::<usize, FetchError>(total)
        }
        .await;

        match transfer {
            Ok(total) => {
                let gate = cancelled.lock().unwrap_or_else(|e| e.into_inner());
                if *gate {
                    editor.abort()?;
                    return Err(FetchError::Cancelled);
                }
                editor.commit()?;
                debug!(key, bytes = total, "Committed download to disk cache");
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = editor.abort() {
                    debug!(key, error = %abort_err, "Failed to abort disk edit");
                }
                Err(e)
            }
        }
    }

    /// Publish a task's outcome and retire its record
    fn complete(&self, key: &str, id: u64, outcome: Result<Arc<D::Output>>) {
        match outcome {
            Ok(payload) => {
                let owned = {
                    let mut tasks = self.lock_tasks();
                    if tasks.get(key).is_some_and(|record| record.id == id) {
                        tasks.remove(key);
                        self.memory.put(key, Arc::clone(&payload));
                        true
                    } else {
                        false
                    }
                };
                if owned {
                    let served = self
                        .registry
                        .drain_and_notify(key, payload, self.notifier.as_ref());
                    debug!(key, waiters = served, "Fetch completed");
                } else {
                    debug!(key, "Discarding result of cancelled fetch");
                }
            }
            Err(e) => {
                self.retire(key, id);
                match &e {
                    // Already counted by cancel_all
                    FetchError::Cancelled => {
                        debug!(key, "Fetch cancelled");
                        return;
                    }
                    e if e.is_transient() => warn!(key, error = %e, "Fetch failed"),
                    e => error!(key, error = %e, "Fetch failed"),
                }
                Counters::incr(&self.counters.failures);
            }
        }
    }

    fn retire(&self, key: &str, id: u64) {
        let mut tasks = self.lock_tasks();
        if tasks.get(key).is_some_and(|record| record.id == id) {
            tasks.remove(key);
        }
    }
}

/// Retires the task record if the task ends without completing, e.g. a panic
struct TaskGuard<D: Decoder> {
    shared: Arc<Shared<D>>,
    key: String,
    id: u64,
}

impl<D: Decoder> Drop for TaskGuard<D> {
    fn drop(&mut self) {
        self.shared.retire(&self.key, self.id);
    }
}
