//! Cache Statistics Module
//!
//! Lock-free counters updated on the hot path, and the serializable snapshot
//! operators read them through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

// == Stats Counter ==
/// Live counters owned by one cache instance.
///
/// Counters only grow; `reset` is the explicit operator action that zeroes them.
#[derive(Debug, Default)]
pub struct StatsCounter {
    requests: AtomicU64,
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    load_success: AtomicU64,
    load_failure: AtomicU64,
    total_load_time_nanos: AtomicU64,
    max_load_time_nanos: AtomicU64,
    evictions: AtomicU64,
    remote_failures: AtomicU64,
}

impl StatsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_hit(&self) {
        self.remote_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_failure(&self) {
        self.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    // == Record Load ==
    /// Records one loader execution and its latency.
    pub fn record_load(&self, success: bool, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        if success {
            self.load_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.load_failure.fetch_add(1, Ordering::Relaxed);
        }
        self.total_load_time_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_load_time_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in [
            &self.requests,
            &self.local_hits,
            &self.remote_hits,
            &self.misses,
            &self.load_success,
            &self.load_failure,
            &self.total_load_time_nanos,
            &self.max_load_time_nanos,
            &self.evictions,
            &self.remote_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self, name: &str, total_entries: usize) -> CacheStats {
        let local_hits = self.local_hits.load(Ordering::Relaxed);
        let remote_hits = self.remote_hits.load(Ordering::Relaxed);
        CacheStats {
            name: name.to_string(),
            requests: self.requests.load(Ordering::Relaxed),
            hits: local_hits + remote_hits,
            local_hits,
            remote_hits,
            misses: self.misses.load(Ordering::Relaxed),
            load_success: self.load_success.load(Ordering::Relaxed),
            load_failure: self.load_failure.load(Ordering::Relaxed),
            total_load_time_nanos: self.total_load_time_nanos.load(Ordering::Relaxed),
            max_load_time_nanos: self.max_load_time_nanos.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            total_entries,
        }
    }
}

// == Cache Stats ==
/// Snapshot of a cache's performance metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub requests: u64,
    /// Local plus remote hits
    pub hits: u64,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub load_success: u64,
    pub load_failure: u64,
    pub total_load_time_nanos: u64,
    pub max_load_time_nanos: u64,
    /// Entries evicted by the local LRU policy
    pub evictions: u64,
    /// Failed remote reads and writes
    pub remote_failures: u64,
    /// Current number of local entries
    pub total_entries: usize,
}

impl CacheStats {
    // == Hit Rate ==
    /// Returns hits / (hits + misses), or 0.0 if nothing was recorded.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Mean loader latency, zero when no load ran.
    pub fn average_load_time(&self) -> Duration {
        let loads = self.load_success + self.load_failure;
        if loads == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total_load_time_nanos / loads)
        }
    }
}
