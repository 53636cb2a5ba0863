//! Stampede Guard Module
//!
//! Ensures at most one loader runs per key. Locally, concurrent callers of a
//! cold key share one in-flight slot and all receive the leader's outcome.
//! With a distributed lock attached, the leader also takes a cluster-wide
//! lease before loading, and gives up after a bounded wait instead of
//! hammering the origin.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::cache::CacheValue;
use crate::error::Result;
use crate::lock::DistributedLock;

/// What a guarded load resolves to: a value (or cached absence), a miss, or the loader's error.
pub type LoadOutcome<V> = Result<Option<CacheValue<V>>>;

type Slot<V> = Arc<OnceCell<LoadOutcome<V>>>;

/// Re-reads both tiers after a lock was obtained or given up on.
#[async_trait]
pub trait TierLookup<V>: Send + Sync {
    async fn lookup(&self, key: &str) -> Option<CacheValue<V>>;
}

/// Timing of the cluster-wide load lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Lease held while loading
    pub lease: Duration,
    /// Deadline for acquiring the lease
    pub wait: Duration,
    /// Pause before the single re-check when the lease was not acquired
    pub retry_delay: Duration,
}

// == Stampede Guard ==
pub struct StampedeGuard<V> {
    in_flight: DashMap<String, Slot<V>>,
    lock: Option<Arc<dyn DistributedLock>>,
    policy: LockPolicy,
}

/// Removes an abandoned in-flight slot once its last holder is done with it.
///
/// A finished load removes its own slot; this covers leaders that were cancelled.
struct SlotRelease<'a, V> {
    map: &'a DashMap<String, Slot<V>>,
    key: &'a str,
    slot: Slot<V>,
}

impl<V> Drop for SlotRelease<'_, V> {
    fn drop(&mut self) {
        // The map holds one reference and this release another
        self.map.remove_if(self.key, |_, current| {
            Arc::ptr_eq(current, &self.slot) && Arc::strong_count(current) <= 2
        });
    }
}

impl<V: Clone + Send + Sync + 'static> StampedeGuard<V> {
    /// Guard with local protection only.
    pub fn local() -> Self {
        Self {
            in_flight: DashMap::new(),
            lock: None,
            policy: LockPolicy {
                lease: crate::config::DEFAULT_LOCK_LEASE,
                wait: crate::config::DEFAULT_LOCK_WAIT,
                retry_delay: crate::config::DEFAULT_LOCK_RETRY_DELAY,
            },
        }
    }

    /// Guard that additionally takes `lock` before loading.
    pub fn distributed(lock: Arc<dyn DistributedLock>, policy: LockPolicy) -> Self {
        Self {
            in_flight: DashMap::new(),
            lock: Some(lock),
            policy,
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.lock.is_some()
    }

    /// Number of keys with a load currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    // == Run ==
    /// Runs `load` for `key` unless another caller already is, and returns the shared outcome.
    ///
    /// `lock_key` names the cluster-wide lease. `tiers` is re-read after every
    /// lock acquisition, because another holder may have populated the value
    /// while this caller waited. `load` is only polled by the leader.
    pub async fn run<F>(
        &self,
        key: &str,
        lock_key: &str,
        tiers: &dyn TierLookup<V>,
        load: F,
    ) -> LoadOutcome<V>
    where
        F: Future<Output = LoadOutcome<V>> + Send,
    {
        let slot = Arc::clone(&*self.in_flight.entry(key.to_string()).or_default());
        let release = SlotRelease {
            map: &self.in_flight,
            key,
            slot,
        };

        let outcome = release
            .slot
            .get_or_init(|| async {
                let outcome = self.lead(key, lock_key, tiers, load).await;
                // Callers arriving from here on start a fresh load
                self.in_flight
                    .remove_if(key, |_, current| Arc::ptr_eq(current, &release.slot));
                outcome
            })
            .await
            .clone();
        outcome
    }

    async fn lead<F>(&self, key: &str, lock_key: &str, tiers: &dyn TierLookup<V>, load: F) -> LoadOutcome<V>
    where
        F: Future<Output = LoadOutcome<V>> + Send,
    {
        if let Some(found) = tiers.lookup(key).await {
            debug!(key = %key, "value appeared while waiting for the local load slot");
            return Ok(Some(found));
        }

        let Some(lock) = &self.lock else {
            return load.await;
        };

        match lock.try_lock(lock_key, self.policy.lease, self.policy.wait).await {
            Ok(Some(handle)) => {
                let outcome = match tiers.lookup(key).await {
                    Some(found) => Ok(Some(found)),
                    None => load.await,
                };
                match lock.unlock(&handle).await {
                    Ok(true) => {}
                    Ok(false) => warn!(key = %key, "load lease expired before release"),
                    Err(e) => warn!(key = %key, error = %e, "failed to release load lease"),
                }
                outcome
            }
            Ok(None) => {
                debug!(key = %key, "load lease busy, re-checking tiers once");
                self.recheck_after_delay(key, tiers).await
            }
            Err(e) => {
                warn!(key = %key, error = %e, "lock service unavailable, re-checking tiers once");
                self.recheck_after_delay(key, tiers).await
            }
        }
    }

    async fn recheck_after_delay(&self, key: &str, tiers: &dyn TierLookup<V>) -> LoadOutcome<V> {
        tokio::time::sleep(self.policy.retry_delay).await;
        Ok(tiers.lookup(key).await)
    }
}
