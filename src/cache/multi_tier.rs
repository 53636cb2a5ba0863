//! Multi-Tier Cache Module
//!
//! Composes the local store, the remote tier, the stampede guard and the event
//! bus into one named cache.
//!
//! ```text
//! get → Local → Remote (promote to Local) → Loader under StampedeGuard → put
//!        <1µs      ~ms, fail-open              once per key
//! ```
//!
//! ## Write ordering
//!
//! With `write_through` the remote tier is written first, otherwise the local
//! tier is. Either way the local tier reflects the write before `put` returns;
//! `async_write` only defers the remote write. Racing readers may briefly see
//! one tier updated and not the other.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cache::guard::{LoadOutcome, StampedeGuard, TierLookup};
use crate::cache::{CacheStats, CacheValue, LocalStore, StatsCounter};
use crate::codec::{decode_entry, encode_entry, KeyCodec, ValueCodec};
use crate::config::CacheConfig;
use crate::error::{BoxError, CacheError, Result};
use crate::events::{CacheEvent, CacheEventType, EventBus};
use crate::lock::{DistributedLock, LockHandle};
use crate::remote::RemoteStore;

/// Future produced by a cache-wide loader.
pub type LoadFuture<V> = Pin<Box<dyn Future<Output = std::result::Result<Option<V>, BoxError>> + Send>>;

/// Cache-wide default loader, invoked on a full miss by `get`.
pub type Loader<K, V> = Arc<dyn Fn(&K) -> LoadFuture<V> + Send + Sync>;

// == Multi Tier Cache ==
/// One named cache spanning the local and remote tiers.
///
/// Created through `CacheBuilder` (or a `CacheRegistry`); its configuration
/// never changes afterwards.
pub struct MultiTierCache<K: ?Sized, V> {
    pub(crate) config: CacheConfig,
    pub(crate) key_codec: Arc<dyn KeyCodec<K>>,
    pub(crate) value_codec: Option<Arc<dyn ValueCodec<V>>>,
    pub(crate) local: Arc<LocalStore<V>>,
    pub(crate) remote: Option<Arc<dyn RemoteStore>>,
    pub(crate) bus: Option<Arc<EventBus>>,
    pub(crate) lock: Arc<dyn DistributedLock>,
    pub(crate) guard: StampedeGuard<V>,
    pub(crate) loader: Option<Loader<K, V>>,
    pub(crate) stats: Arc<StatsCounter>,
    pub(crate) write_permits: Arc<Semaphore>,
}

impl<K, V> MultiTierCache<K, V>
where
    K: ?Sized + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // == Get ==
    /// Reads `key` from the local tier, then the remote tier, then the default loader.
    ///
    /// Returns `Ok(None)` on a miss or a cached absence. Only loader failures
    /// (and load timeouts) are returned as errors.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let key_str = self.key_codec.convert(key);
        if let Some(found) = self.read_through(&key_str).await {
            return Ok(found.into_option());
        }

        let Some(loader) = &self.loader else {
            return Ok(None);
        };
        let loader = Arc::clone(loader);
        self.load_guarded(&key_str, async move { loader(key).await }, None)
            .await
    }

    // == Compute If Absent ==
    /// Like `get`, but loads a miss with `loader` instead of the default loader.
    pub async fn compute_if_absent<F, Fut>(&self, key: &K, loader: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<Option<V>, BoxError>> + Send,
    {
        self.compute(key, loader, None).await
    }

    /// `compute_if_absent` writing the loaded value with an explicit TTL.
    pub async fn compute_if_absent_with_ttl<F, Fut>(
        &self,
        key: &K,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<Option<V>, BoxError>> + Send,
    {
        self.compute(key, loader, Some(ttl)).await
    }

    pub(crate) async fn compute<F, Fut>(
        &self,
        key: &K,
        loader: F,
        ttl: Option<Duration>,
    ) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<Option<V>, BoxError>> + Send,
    {
        let key_str = self.key_codec.convert(key);
        if let Some(found) = self.read_through(&key_str).await {
            return Ok(found.into_option());
        }
        self.load_guarded(&key_str, async move { loader().await }, ttl)
            .await
    }

    // == Put ==
    /// Writes `value` to both tiers with the configured expire-after-write.
    pub async fn put(&self, key: &K, value: V) {
        self.put_value(key, CacheValue::Present(value), None).await;
    }

    pub async fn put_with_ttl(&self, key: &K, value: V, ttl: Duration) {
        self.put_value(key, CacheValue::Present(value), Some(ttl)).await;
    }

    /// Records that `key` has no value; a no-op unless `cache_null_values` is set.
    pub async fn put_absent(&self, key: &K) {
        self.put_value(key, CacheValue::Null, None).await;
    }

    async fn put_value(&self, key: &K, value: CacheValue<V>, ttl: Option<Duration>) {
        let key_str = self.key_codec.convert(key);
        self.write(&key_str, value, ttl).await;
    }

    // == Remove ==
    /// Deletes `key` from both tiers; returns whether the remote tier held it.
    ///
    /// Without a reachable remote tier the local tier's answer is returned.
    pub async fn remove(&self, key: &K) -> bool {
        let key_str = self.key_codec.convert(key);

        let remote_existed = match &self.remote {
            Some(remote) => match remote.delete(&self.remote_key(&key_str)).await {
                Ok(existed) => Some(existed),
                Err(e) => {
                    self.stats.record_remote_failure();
                    warn!(cache = %self.config.name, key = %key_str, error = %e, "remote delete failed");
                    None
                }
            },
            None => None,
        };
        let local_existed = self.local.invalidate(&key_str);

        self.publish(CacheEventType::Remove, Some(&key_str)).await;
        remote_existed.unwrap_or(local_existed)
    }

    // == Clear ==
    /// Empties this cache's namespace in both tiers.
    pub async fn clear(&self) {
        if let Some(remote) = &self.remote {
            match remote.delete_by_prefix(&self.config.remote_prefix()).await {
                Ok(removed) => debug!(cache = %self.config.name, removed, "remote namespace cleared"),
                Err(e) => {
                    self.stats.record_remote_failure();
                    warn!(cache = %self.config.name, error = %e, "remote clear failed");
                }
            }
        }
        self.local.clear();
        self.publish(CacheEventType::Clear, None).await;
    }

    /// True if either tier holds `key` (a cached absence counts).
    pub async fn contains_key(&self, key: &K) -> bool {
        let key_str = self.key_codec.convert(key);
        if self.local.contains(&key_str) {
            return true;
        }
        let Some(remote) = &self.remote else {
            return false;
        };
        match remote.exists(&self.remote_key(&key_str)).await {
            Ok(exists) => exists,
            Err(e) => {
                self.stats.record_remote_failure();
                warn!(cache = %self.config.name, key = %key_str, error = %e, "remote exists failed");
                false
            }
        }
    }

    // == Locks ==
    /// Tries to take the lock named by `key` for `ttl`.
    ///
    /// Returns None when someone else holds it or the lock service failed.
    pub async fn try_lock(&self, key: &K, ttl: Duration) -> Option<LockHandle> {
        let lock_key = self.config.lock_key(&self.key_codec.convert(key));
        match self.lock.try_lock(&lock_key, ttl, self.config.lock_wait).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(cache = %self.config.name, key = %lock_key, error = %e, "try_lock failed");
                None
            }
        }
    }

    /// Releases a lock obtained from `try_lock`; false if the lease was lost.
    pub async fn unlock(&self, handle: &LockHandle) -> bool {
        match self.lock.unlock(handle).await {
            Ok(released) => released,
            Err(e) => {
                warn!(cache = %self.config.name, key = %handle.key, error = %e, "unlock failed");
                false
            }
        }
    }

    /// Runs `action` while holding the lock for `key`; returns false if the lock was not acquired.
    pub async fn try_lock_and_run<F, Fut>(&self, key: &K, ttl: Duration, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let Some(handle) = self.try_lock(key, ttl).await else {
            return false;
        };
        action().await;
        if !self.unlock(&handle).await {
            debug!(cache = %self.config.name, key = %handle.key, "lock expired before action finished");
        }
        true
    }

    // == Stats ==
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot(&self.config.name, self.local.len())
    }

    /// Zeroes the counters; an explicit operator action.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub fn local_size(&self) -> usize {
        self.local.len()
    }

    /// Drops expired local entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.local.purge_expired()
    }

    // == Internals ==
    fn remote_key(&self, key_str: &str) -> String {
        format!("{}{}", self.config.remote_prefix(), key_str)
    }

    /// Full lookup recording request, hit and miss counters.
    async fn read_through(&self, key_str: &str) -> Option<CacheValue<V>> {
        self.stats.record_request();

        if let Some(found) = self.local.get(key_str) {
            self.stats.record_local_hit();
            return Some(found);
        }
        if let Some(found) = self.read_remote(key_str).await {
            self.stats.record_remote_hit();
            self.promote(key_str, found.clone());
            return Some(found);
        }

        self.stats.record_miss();
        None
    }

    async fn read_remote(&self, key_str: &str) -> Option<CacheValue<V>> {
        let remote = self.remote.as_ref()?;
        let codec = self.value_codec.as_ref()?;

        match remote.get(&self.remote_key(key_str)).await {
            Ok(Some(bytes)) => match decode_entry(codec.as_ref(), &bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(cache = %self.config.name, key = %key_str, error = %e, "undecodable remote value");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.stats.record_remote_failure();
                warn!(cache = %self.config.name, key = %key_str, error = %e, "remote get failed, treating as miss");
                None
            }
        }
    }

    fn promote(&self, key_str: &str, value: CacheValue<V>) {
        self.local.put(key_str, value, self.config.local_ttl(None));
        debug!(cache = %self.config.name, key = %key_str, "promoted remote value to local tier");
    }

    async fn load_guarded<Fut>(&self, key_str: &str, load: Fut, ttl: Option<Duration>) -> Result<Option<V>>
    where
        Fut: Future<Output = std::result::Result<Option<V>, BoxError>> + Send,
    {
        let lock_key = self.config.load_lock_key(key_str);
        let work = self.load_and_store(key_str, load, ttl);
        let outcome = self.guard.run(key_str, &lock_key, self, work).await?;
        Ok(outcome.and_then(CacheValue::into_option))
    }

    /// Runs the loader once, timed, and writes a cacheable result to both tiers.
    async fn load_and_store<Fut>(&self, key_str: &str, load: Fut, ttl: Option<Duration>) -> LoadOutcome<V>
    where
        Fut: Future<Output = std::result::Result<Option<V>, BoxError>> + Send,
    {
        let started = Instant::now();
        let loaded = match self.config.load_timeout {
            Some(limit) => match tokio::time::timeout(limit, load).await {
                Ok(result) => result.map_err(CacheError::loader),
                Err(_) => Err(CacheError::LoadTimeout(limit)),
            },
            None => load.await.map_err(CacheError::loader),
        };
        let elapsed = started.elapsed();
        self.stats.record_load(loaded.is_ok(), elapsed);

        match loaded {
            Ok(value) => {
                let value = CacheValue::from(value);
                debug!(cache = %self.config.name, key = %key_str, elapsed_us = elapsed.as_micros() as u64, "loaded value");
                if value.is_null() && !self.config.cache_null_values {
                    return Ok(None);
                }
                self.write(key_str, value.clone(), ttl).await;
                Ok(Some(value))
            }
            Err(e) => {
                warn!(cache = %self.config.name, key = %key_str, error = %e, "loader failed");
                Err(e)
            }
        }
    }

    /// Writes both tiers in the configured order, then publishes a PUT event.
    async fn write(&self, key_str: &str, value: CacheValue<V>, ttl: Option<Duration>) {
        if value.is_null() && !self.config.cache_null_values {
            return;
        }

        let encoded = self.encode_for_remote(key_str, &value);
        let local_ttl = self.config.local_ttl(ttl);

        if self.config.write_through {
            if let Some(bytes) = encoded {
                self.write_remote(key_str, bytes, ttl).await;
            }
            self.local.put(key_str, value, local_ttl);
        } else {
            self.local.put(key_str, value, local_ttl);
            if let Some(bytes) = encoded {
                self.write_remote(key_str, bytes, ttl).await;
            }
        }

        self.publish(CacheEventType::Put, Some(key_str)).await;
    }

    fn encode_for_remote(&self, key_str: &str, value: &CacheValue<V>) -> Option<Vec<u8>> {
        self.remote.as_ref()?;
        let codec = self.value_codec.as_ref()?;
        match encode_entry(codec.as_ref(), value) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(cache = %self.config.name, key = %key_str, error = %e, "value not encodable, skipping remote write");
                None
            }
        }
    }

    async fn write_remote(&self, key_str: &str, bytes: Vec<u8>, ttl: Option<Duration>) {
        let Some(remote) = &self.remote else {
            return;
        };
        let remote_key = self.remote_key(key_str);
        let remote_ttl = self.config.remote_ttl(ttl);

        if !self.config.async_write {
            if let Err(e) = remote.put(&remote_key, bytes, remote_ttl).await {
                self.stats.record_remote_failure();
                warn!(cache = %self.config.name, key = %remote_key, error = %e, "remote write failed");
            }
            return;
        }

        let remote = Arc::clone(remote);
        let stats = Arc::clone(&self.stats);
        let permits = Arc::clone(&self.write_permits);
        let cache = self.config.name.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = remote.put(&remote_key, bytes, remote_ttl).await {
                stats.record_remote_failure();
                warn!(cache = %cache, key = %remote_key, error = %e, "async remote write failed");
            }
        });
    }

    async fn publish(&self, event_type: CacheEventType, key_str: Option<&str>) {
        if !self.config.sync_local {
            return;
        }
        let Some(bus) = &self.bus else {
            return;
        };
        let event = CacheEvent::new(
            self.config.name.clone(),
            key_str.map(str::to_string),
            event_type,
            bus.instance_id(),
        );
        bus.publish(&event).await;
    }
}

#[async_trait]
impl<K, V> TierLookup<V> for MultiTierCache<K, V>
where
    K: ?Sized + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Re-check used by the stampede guard; does not touch the counters.
    async fn lookup(&self, key: &str) -> Option<CacheValue<V>> {
        if let Some(found) = self.local.get(key) {
            return Some(found);
        }
        let found = self.read_remote(key).await?;
        self.promote(key, found.clone());
        Some(found)
    }
}
