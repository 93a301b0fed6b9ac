//! Statistics types

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time statistics about both cache tiers and the fetch pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub memory_capacity: usize,
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub disk_hits: u64,
    pub network_fetches: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub in_flight: usize,
    pub pending_keys: usize,
}

/// Monotonic counters shared by fetch tasks
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub disk_hits: AtomicU64,
    pub network_fetches: AtomicU64,
    pub failures: AtomicU64,
    pub cancellations: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.memory_bytes, 0);
        assert_eq!(stats.disk_hits, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_cache_stats_serialization() {
        let stats = CacheStats {
            memory_entries: 3,
            memory_bytes: 12345,
            network_fetches: 7,
            ..Default::default()
        };

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"memory_bytes\":12345"));
        assert!(json.contains("\"network_fetches\":7"));

        let deserialized: CacheStats = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, stats);
    }

    #[test]
    fn test_counters() {
        let counters = Counters::default();
        Counters::incr(&counters.failures);
        Counters::add(&counters.failures, 2);
        assert_eq!(Counters::get(&counters.failures), 3);
        assert_eq!(Counters::get(&counters.disk_hits), 0);
    }
}
