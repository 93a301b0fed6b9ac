//! Loader configuration

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Worker pool size
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Memory budget the memory tier takes a fraction of
pub const DEFAULT_MEMORY_BUDGET: usize = 256 * 1024 * 1024;

/// Memory tier capacity is `memory_budget / memory_fraction`
pub const DEFAULT_MEMORY_FRACTION: usize = 8;

pub const DEFAULT_DISK_MAX_SIZE: u64 = 20 * 1024 * 1024;

/// Schema version of the disk store. Bumping it discards every entry.
pub const DISK_CACHE_VERSION: u32 = 215;

pub const DEFAULT_HASH_ALGORITHM: &str = "sha256";

pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Subdirectory holding the disk store
pub const CACHE_UNIQUE_NAME: &str = "thumb";

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub pool_size: usize,
    pub memory_budget: usize,
    pub memory_fraction: usize,
    /// Explicit disk cache directory, resolved by [`resolve_cache_dir`] when unset
    pub cache_dir: Option<PathBuf>,
    pub disk_max_size: u64,
    pub disk_version: u32,
    pub hash_algorithm: String,
    /// Upper bound for [`Loader::load`](crate::Loader::load)
    pub load_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            memory_fraction: DEFAULT_MEMORY_FRACTION,
            cache_dir: None,
            disk_max_size: DEFAULT_DISK_MAX_SIZE,
            disk_version: DISK_CACHE_VERSION,
            hash_algorithm: DEFAULT_HASH_ALGORITHM.to_string(),
            load_timeout: DEFAULT_LOAD_TIMEOUT,
        }
    }
}

impl LoaderConfig {
    /// Read `AIMAGE_*` environment variables over the defaults.
    ///
    /// Values that fail to parse keep their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let pool_size = env_parse("AIMAGE_POOL_SIZE").unwrap_or(defaults.pool_size);

        let memory_budget = env_parse("AIMAGE_MEMORY_BUDGET").unwrap_or(defaults.memory_budget);

        let memory_fraction =
            env_parse("AIMAGE_MEMORY_FRACTION").unwrap_or(defaults.memory_fraction);

        let cache_dir = std::env::var("AIMAGE_CACHE_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let disk_max_size = env_parse("AIMAGE_DISK_MAX_SIZE").unwrap_or(defaults.disk_max_size);

        let hash_algorithm =
            std::env::var("AIMAGE_HASH").unwrap_or_else(|_| defaults.hash_algorithm.clone());

        let load_timeout = env_parse::<u64>("AIMAGE_LOAD_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.load_timeout);

        Self {
            pool_size,
            memory_budget,
            memory_fraction,
            cache_dir,
            disk_max_size,
            disk_version: defaults.disk_version,
            hash_algorithm,
            load_timeout,
        }
    }

    /// Byte capacity of the memory tier
    pub fn memory_capacity(&self) -> usize {
        self.memory_budget / self.memory_fraction.max(1)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(var = name, value = %value, "Ignoring unparseable setting");
            None
        }
    }
}

/// Pick the disk cache directory.
///
/// An explicit directory wins. Otherwise the platform cache directory is
/// used, then the system temp directory when there is none.
pub fn resolve_cache_dir(configured: Option<&Path>, unique_name: &str) -> PathBuf {
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("aimage")
        .join(unique_name)
}
