//! Stats Report Task

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::registry::CacheRegistry;

/// Spawns a task logging every cache's stats snapshot each `interval`.
pub fn spawn_stats_reporter(registry: Arc<CacheRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            for stats in registry.stats() {
                info!(
                    cache = %stats.name,
                    requests = stats.requests,
                    hits = stats.hits,
                    local_hits = stats.local_hits,
                    remote_hits = stats.remote_hits,
                    misses = stats.misses,
                    hit_rate = stats.hit_rate(),
                    load_success = stats.load_success,
                    load_failure = stats.load_failure,
                    avg_load_us = stats.average_load_time().as_micros() as u64,
                    evictions = stats.evictions,
                    remote_failures = stats.remote_failures,
                    entries = stats.total_entries,
                    "cache stats"
                );
            }
        }
    })
}
