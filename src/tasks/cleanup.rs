//! TTL Cleanup Task
//!
//! Background task that periodically removes expired local entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::CacheRegistry;

/// Spawns a background task that purges expired local entries of every cache.
///
/// Reads already skip expired entries; this keeps memory from holding entries
/// nobody asks for again.
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let registry = Arc::new(CacheRegistry::new(Config::default()));
/// let cleanup_handle = spawn_cleanup_task(registry.clone(), Duration::from_secs(1));
/// // Later, during shutdown:
/// cleanup_handle.abort();
/// ```
pub fn spawn_cleanup_task(registry: Arc<CacheRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "starting TTL cleanup task");

        loop {
            tokio::time::sleep(interval).await;

            let removed = registry.purge_expired();
            if removed > 0 {
                info!(removed, "TTL cleanup: purged expired entries");
            } else {
                debug!("TTL cleanup: no expired entries found");
            }
        }
    })
}
