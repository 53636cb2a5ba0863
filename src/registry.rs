//! Cache Registry Module
//!
//! Owns every named cache of one process together with the collaborators they
//! share: the remote tier, the lock service and the event bus.

use std::any::Any;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::cache::{CacheBuilder, CacheStats, MultiTierCache};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::events::{EventBus, MemoryTransport, PubSubTransport};
use crate::lock::{DistributedLock, MemoryLock};
use crate::remote::{MemoryRemoteStore, RemoteStore};

/// Type-erased view of a cache the registry can maintain without knowing `K`/`V`.
trait ManagedCache: Send + Sync {
    fn stats(&self) -> CacheStats;
    fn purge_expired(&self) -> usize;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<K, V> ManagedCache for MultiTierCache<K, V>
where
    K: ?Sized + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn stats(&self) -> CacheStats {
        MultiTierCache::stats(self)
    }

    fn purge_expired(&self) -> usize {
        MultiTierCache::purge_expired(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// == Cache Registry ==
/// Explicit name → cache registry.
///
/// ## How It Works
///
/// 1. `get_or_create` returns the existing cache for a name, or builds one from
///    the process defaults plus the shared collaborators
/// 2. The configuration is fixed at creation; later calls for the same name
///    get the original instance and their `configure` closure is not run
/// 3. Asking for a name with a different key or value type is an error
pub struct CacheRegistry {
    config: Config,
    caches: DashMap<String, Arc<dyn ManagedCache>>,
    remote: Option<Arc<dyn RemoteStore>>,
    lock: Option<Arc<dyn DistributedLock>>,
    bus: Option<Arc<EventBus>>,
}

impl CacheRegistry {
    /// Registry with no shared collaborators; caches are local-only.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            caches: DashMap::new(),
            remote: None,
            lock: None,
            bus: None,
        }
    }

    /// Registry backed by in-process remote tier, lock and transport.
    ///
    /// Registries built over the same `Arc`s behave like instances sharing
    /// one cluster; pass `None` to get fresh ones.
    pub fn in_memory(
        config: Config,
        shared: Option<(Arc<MemoryRemoteStore>, Arc<MemoryLock>, Arc<MemoryTransport>)>,
    ) -> Self {
        let (remote, lock, transport) = shared.unwrap_or_else(|| {
            (
                Arc::new(MemoryRemoteStore::new()),
                Arc::new(MemoryLock::new()),
                Arc::new(MemoryTransport::new()),
            )
        });
        Self::new(config)
            .with_remote(remote)
            .with_lock(lock)
            .with_transport(transport)
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Creates the event bus on `transport` using this registry's instance id and channel.
    pub fn with_transport(mut self, transport: Arc<dyn PubSubTransport>) -> Self {
        self.bus = Some(EventBus::new(
            self.config.instance_id.clone(),
            self.config.event_channel.clone(),
            transport,
        ));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn event_bus(&self) -> Option<&Arc<EventBus>> {
        self.bus.as_ref()
    }

    /// Starts receiving events from other instances.
    pub async fn start(&self) -> Result<()> {
        if let Some(bus) = &self.bus {
            bus.start().await?;
        }
        Ok(())
    }

    // == Get Or Create ==
    /// Returns the cache named `name`, creating it with `configure` if absent.
    ///
    /// `configure` receives a builder preloaded with the process defaults and
    /// the shared collaborators. It runs while the name's slot is held, so it
    /// must not call back into this registry.
    pub fn get_or_create<K, V, F>(&self, name: &str, configure: F) -> Result<Arc<MultiTierCache<K, V>>>
    where
        K: ?Sized + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(CacheBuilder<K, V>) -> CacheBuilder<K, V>,
    {
        match self.caches.entry(name.to_string()) {
            Entry::Occupied(existing) => downcast(name, Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                let cache = Arc::new(configure(self.builder(name)).build()?);
                slot.insert(cache.clone());
                Ok(cache)
            }
        }
    }

    /// Builder for `name` carrying this registry's defaults and collaborators.
    pub fn builder<K, V>(&self, name: &str) -> CacheBuilder<K, V>
    where
        K: ?Sized + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let mut builder = CacheBuilder::with_defaults(name, &self.config);
        if let Some(remote) = &self.remote {
            builder = builder.remote(Arc::clone(remote));
        }
        if let Some(lock) = &self.lock {
            builder = builder.lock(Arc::clone(lock));
        }
        if let Some(bus) = &self.bus {
            builder = builder.event_bus(Arc::clone(bus));
        }
        builder
    }

    /// The existing cache named `name`, if any.
    pub fn get<K, V>(&self, name: &str) -> Result<Option<Arc<MultiTierCache<K, V>>>>
    where
        K: ?Sized + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let Some(existing) = self.caches.get(name).map(|entry| Arc::clone(entry.value())) else {
            return Ok(None);
        };
        downcast(name, existing).map(Some)
    }

    /// Forgets the cache named `name` and stops applying events to it.
    ///
    /// Handles already given out keep working but no longer receive invalidations.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.caches.remove(name).is_some();
        if removed {
            if let Some(bus) = &self.bus {
                bus.unregister(name);
            }
            info!(cache = %name, "cache removed from registry");
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Stats snapshots of every cache, ordered by name.
    pub fn stats(&self) -> Vec<CacheStats> {
        let mut stats: Vec<CacheStats> = self.caches.iter().map(|entry| entry.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Purges expired local entries of every cache; returns the total removed.
    pub fn purge_expired(&self) -> usize {
        self.caches.iter().map(|entry| entry.value().purge_expired()).sum()
    }

    /// Stops the event subscription and drops every cache.
    pub fn shutdown(&self) {
        if let Some(bus) = &self.bus {
            bus.shutdown();
        }
        let names = self.names();
        for name in &names {
            if let Some(bus) = &self.bus {
                bus.unregister(name);
            }
        }
        self.caches.clear();
        info!(caches = names.len(), "cache registry shut down");
    }
}

fn downcast<K, V>(name: &str, cache: Arc<dyn ManagedCache>) -> Result<Arc<MultiTierCache<K, V>>>
where
    K: ?Sized + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache.into_any().downcast::<MultiTierCache<K, V>>().map_err(|_| {
        CacheError::Configuration(format!(
            "cache '{name}' already exists with different key or value types"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DisplayKeyCodec, JsonCodec};
    use std::time::Duration;

    fn registry() -> CacheRegistry {
        CacheRegistry::in_memory(Config::default(), None)
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let registry = registry();
        let first = registry
            .get_or_create::<u64, String, _>("orders", |b| {
                b.key_codec(DisplayKeyCodec).value_codec(JsonCodec::new())
            })
            .unwrap();
        let second = registry
            .get_or_create::<u64, String, _>("orders", |b| {
                b.key_codec(DisplayKeyCodec)
                    .value_codec(JsonCodec::new())
                    .expire_after_write(Duration::from_secs(1))
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().expire_after_write, Some(Duration::from_secs(300)));
        assert_eq!(registry.names(), vec!["orders".to_string()]);
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let registry = registry();
        registry
            .get_or_create::<u64, String, _>("orders", |b| {
                b.key_codec(DisplayKeyCodec).value_codec(JsonCodec::new())
            })
            .unwrap();

        let mismatch = registry.get_or_create::<u64, u32, _>("orders", |b| {
            b.key_codec(DisplayKeyCodec).value_codec(JsonCodec::new())
        });
        assert!(matches!(mismatch, Err(CacheError::Configuration(_))));
        assert!(registry.get::<String, String>("orders").is_err());
        assert!(registry.get::<u64, String>("orders").unwrap().is_some());
        assert!(registry.get::<u64, String>("users").unwrap().is_none());
    }

    #[test]
    fn test_failed_build_registers_nothing() {
        let registry = registry();
        // The shared remote tier needs a value codec
        let result = registry.get_or_create::<u64, String, _>("orders", |b| b.key_codec(DisplayKeyCodec));
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_shutdown() {
        let registry = registry();
        registry.start().await.unwrap();
        let orders = registry
            .get_or_create::<u64, String, _>("orders", |b| {
                b.key_codec(DisplayKeyCodec).value_codec(JsonCodec::new())
            })
            .unwrap();
        orders.put(&1, "one".to_string()).await;

        let bus = Arc::clone(registry.event_bus().unwrap());
        assert_eq!(bus.listener_count("orders"), 1);
        assert_eq!(registry.stats().len(), 1);

        assert!(registry.remove("orders"));
        assert!(!registry.remove("orders"));
        assert_eq!(bus.listener_count("orders"), 0);

        registry.shutdown();
        assert!(!bus.is_running());
    }
}
