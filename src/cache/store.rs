//! Local Store Module
//!
//! Bounded in-process tier combining HashMap storage with LRU tracking and
//! TTL expiration. Safe to share between caller tasks and the event bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cache::{CacheEntry, CacheValue, LruTracker, StatsCounter};
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, CacheEventListener, CacheEventType};

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    lru: LruTracker,
}

// == Local Store ==
/// Local tier with LRU eviction and TTL support.
///
/// Expired entries are purged lazily on read and in bulk by `purge_expired`.
/// The internal mutex is never held across an await point.
#[derive(Debug)]
pub struct LocalStore<V> {
    inner: Mutex<Inner<V>>,
    /// Maximum number of entries allowed
    capacity: usize,
    /// Idle TTL refreshed by reads
    expire_after_access: Option<Duration>,
    stats: Arc<StatsCounter>,
}

impl<V: Clone> LocalStore<V> {
    // == Constructor ==
    /// Creates a store holding at most `capacity` entries.
    pub fn new(
        capacity: usize,
        expire_after_access: Option<Duration>,
        stats: Arc<StatsCounter>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(CacheError::Configuration(
                "local capacity must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: LruTracker::new(),
            }),
            capacity,
            expire_after_access,
            stats,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // == Get ==
    /// Returns the live value for `key`, or None on a miss.
    ///
    /// A cached absence comes back as `Some(CacheValue::Null)`.
    pub fn get(&self, key: &str) -> Option<CacheValue<V>> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        let expired = inner.entries.get(key)?.is_expired();
        if expired {
            inner.entries.remove(key);
            inner.lru.remove(key);
            debug!(key = %key, "local entry expired");
            return None;
        }

        let entry = inner.entries.get_mut(key)?;
        entry.touch(self.expire_after_access);
        inner.lru.touch(key);
        Some(entry.value.clone())
    }

    // == Put ==
    /// Stores a value, overwriting and resetting the TTL of any existing entry.
    ///
    /// When the store is full the least recently used entry is evicted first.
    pub fn put(&self, key: &str, value: CacheValue<V>, ttl: Option<Duration>) {
        let mut inner = self.lock();

        if !inner.entries.contains_key(key) && inner.entries.len() >= self.capacity {
            if let Some(evicted) = inner.lru.evict_oldest() {
                inner.entries.remove(&evicted);
                self.stats.record_eviction();
                debug!(key = %evicted, "local entry evicted");
            }
        }

        inner
            .entries
            .insert(key.to_string(), CacheEntry::new(value, ttl, self.expire_after_access));
        inner.lru.touch(key);
    }

    // == Invalidate ==
    /// Removes an entry; returns whether a live entry was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.lock();
        inner.lru.remove(key);
        inner
            .entries
            .remove(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// True if a live entry exists, without touching LRU order.
    pub fn contains(&self, key: &str) -> bool {
        self.lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.lru.clear();
    }

    // == Purge Expired ==
    /// Removes all expired entries and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.lock();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.entries.remove(key);
            inner.lru.remove(key);
        }
        expired.len()
    }

    /// Current number of entries, expired ones not yet purged included.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<V: Clone + Send + Sync> CacheEventListener for LocalStore<V> {
    /// Foreign mutations only ever invalidate; the next read refetches from the remote tier.
    fn on_event(&self, event: &CacheEvent) -> Result<()> {
        match event.event_type {
            CacheEventType::Put | CacheEventType::Remove => {
                let key = event.key.as_deref().ok_or_else(|| {
                    CacheError::EventDelivery(format!(
                        "{:?} event for cache '{}' carries no key",
                        event.event_type, event.cache_name
                    ))
                })?;
                self.invalidate(key);
            }
            CacheEventType::Clear => self.clear(),
        }
        Ok(())
    }
}
