//! Two-tier image cache with deduplicated concurrent fetching
//!
//! Images are resolved memory first, then from a journal-indexed disk store,
//! then from the network. Concurrent requests for the same key share one
//! fetch, and every waiting consumer is served with the same decoded payload
//! on the execution context chosen by a [`Notifier`].

mod config;
mod coordinator;
mod decode;
mod disk;
mod error;
mod hasher;
mod journal;
mod loader;
mod memory;
mod notifier;
mod transport;
mod types;
mod waiters;

pub use config::{resolve_cache_dir, LoaderConfig, CACHE_UNIQUE_NAME, DISK_CACHE_VERSION};
pub use coordinator::FetchCoordinator;
pub use decode::{Decoder, RawDecoder};
pub use disk::{DiskStore, Editor, Snapshot};
pub use error::{FetchError, LoadError, Result};
pub use hasher::{HashAlgorithm, KeyHasher};
pub use loader::Loader;
pub use memory::{MemoryCache, Weigher};
pub use notifier::{
    delivery_queue, Delivery, DeliveryQueue, InlineNotifier, Notifier, QueueNotifier,
};
pub use transport::{ByteStream, HttpTransport, Transport};
pub use types::CacheStats;
pub use waiters::{Consumer, ConsumerId, ImageTarget, WaiterRegistry};
