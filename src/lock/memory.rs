//! In-process lease lock.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{DistributedLock, LockHandle};
use crate::error::Result;

/// Poll interval while waiting for a held lock.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// Lease lock scoped to one process.
///
/// Caches sharing one `Arc<MemoryLock>` exclude each other like instances
/// sharing a lock service. Leases expire on their own; an expired lease is
/// taken over by the next caller, and every acquisition drops abandoned ones.
#[derive(Debug, Default)]
pub struct MemoryLock {
    leases: DashMap<String, Lease>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, key: &str, lease: Duration) -> Option<LockHandle> {
        let handle = LockHandle::new(key, lease);
        let granted = Lease {
            token: handle.token.clone(),
            expires_at: handle.expires_at,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if Instant::now() < held.get().expires_at {
                    return None;
                }
                debug!(key = %key, "taking over expired lease");
                held.insert(granted);
            }
            Entry::Vacant(slot) => {
                slot.insert(granted);
            }
        }
        Some(handle)
    }

    /// Drops leases that expired without being released; returns how many.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.leases.len();
        self.leases.retain(|_, lease| now < lease.expires_at);
        before.saturating_sub(self.leases.len())
    }

    /// Number of leases held, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// True while a live lease exists for `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .is_some_and(|lease| Instant::now() < lease.expires_at)
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_lock(&self, key: &str, lease: Duration, wait: Duration) -> Result<Option<LockHandle>> {
        let deadline = Instant::now() + wait;
        let purged = self.purge_expired();
        if purged > 0 {
            debug!(purged, "dropped abandoned leases");
        }
        loop {
            if let Some(handle) = self.acquire(key, lease) {
                return Ok(Some(handle));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn unlock(&self, handle: &LockHandle) -> Result<bool> {
        Ok(self
            .leases
            .remove_if(&handle.key, |_, lease| lease.token == handle.token)
            .is_some())
    }
}
