//! Cache Builder Module
//!
//! Assembles a `MultiTierCache` from a `CacheConfig` and its collaborators,
//! rejecting combinations that cannot work before any tier is touched.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::info;

use crate::cache::guard::{LockPolicy, StampedeGuard};
use crate::cache::multi_tier::{LoadFuture, Loader, MultiTierCache};
use crate::cache::{LocalStore, StatsCounter};
use crate::codec::{KeyCodec, ValueCodec};
use crate::config::{CacheConfig, Config};
use crate::error::{BoxError, CacheError, Result};
use crate::events::EventBus;
use crate::lock::{DistributedLock, MemoryLock};
use crate::remote::RemoteStore;

/// Builder for one named cache.
///
/// # Example
/// ```ignore
/// let cache = CacheBuilder::<u64, Order>::new("orders")
///     .key_codec(DisplayKeyCodec)
///     .value_codec(JsonCodec::new())
///     .remote(remote)
///     .event_bus(bus)
///     .expire_after_write(Duration::from_secs(60))
///     .build()?;
/// ```
pub struct CacheBuilder<K: ?Sized, V> {
    config: CacheConfig,
    key_codec: Option<Arc<dyn KeyCodec<K>>>,
    value_codec: Option<Arc<dyn ValueCodec<V>>>,
    remote: Option<Arc<dyn RemoteStore>>,
    bus: Option<Arc<EventBus>>,
    lock: Option<Arc<dyn DistributedLock>>,
    loader: Option<Loader<K, V>>,
}

impl<K, V> CacheBuilder<K, V>
where
    K: ?Sized + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Builder for `name` with the built-in defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_defaults(name, &Config::default())
    }

    /// Builder for `name` starting from process-wide defaults.
    pub fn with_defaults(name: impl Into<String>, defaults: &Config) -> Self {
        Self::from_config(CacheConfig::from_defaults(name, defaults))
    }

    pub fn from_config(config: CacheConfig) -> Self {
        Self {
            config,
            key_codec: None,
            value_codec: None,
            remote: None,
            bus: None,
            lock: None,
            loader: None,
        }
    }

    // == Policy ==
    pub fn expire_after_write(mut self, ttl: Duration) -> Self {
        self.config.expire_after_write = Some(ttl);
        self
    }

    /// Entries never expire by write age.
    pub fn no_expiry(mut self) -> Self {
        self.config.expire_after_write = None;
        self
    }

    pub fn expire_after_access(mut self, idle: Duration) -> Self {
        self.config.expire_after_access = Some(idle);
        self
    }

    pub fn local_expire(mut self, cap: Duration) -> Self {
        self.config.local_expire = Some(cap);
        self
    }

    pub fn local_capacity(mut self, capacity: usize) -> Self {
        self.config.local_capacity = capacity;
        self
    }

    pub fn cache_null_values(mut self, enabled: bool) -> Self {
        self.config.cache_null_values = enabled;
        self
    }

    pub fn penetration_protect(mut self, enabled: bool) -> Self {
        self.config.penetration_protect = enabled;
        self
    }

    pub fn write_through(mut self, enabled: bool) -> Self {
        self.config.write_through = enabled;
        self
    }

    pub fn async_write(mut self, enabled: bool) -> Self {
        self.config.async_write = enabled;
        self
    }

    pub fn sync_local(mut self, enabled: bool) -> Self {
        self.config.sync_local = enabled;
        self
    }

    pub fn load_timeout(mut self, limit: Duration) -> Self {
        self.config.load_timeout = Some(limit);
        self
    }

    pub fn lock_lease(mut self, lease: Duration) -> Self {
        self.config.lock_lease = lease;
        self
    }

    pub fn lock_wait(mut self, wait: Duration) -> Self {
        self.config.lock_wait = wait;
        self
    }

    pub fn lock_retry_delay(mut self, delay: Duration) -> Self {
        self.config.lock_retry_delay = delay;
        self
    }

    pub fn async_write_concurrency(mut self, permits: usize) -> Self {
        self.config.async_write_concurrency = permits;
        self
    }

    // == Collaborators ==
    pub fn key_codec(mut self, codec: impl KeyCodec<K> + 'static) -> Self {
        self.key_codec = Some(Arc::new(codec));
        self
    }

    pub fn value_codec(mut self, codec: impl ValueCodec<V> + 'static) -> Self {
        self.value_codec = Some(Arc::new(codec));
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Default loader used by `get` on a full miss.
    pub fn loader<F, Fut>(mut self, load: F) -> Self
    where
        F: Fn(&K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<V>, BoxError>> + Send + 'static,
    {
        self.loader = Some(Arc::new(move |key: &K| -> LoadFuture<V> { Box::pin(load(key)) }));
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // == Build ==
    /// Validates the configuration and wires the tiers together.
    ///
    /// With `sync_local` and an event bus, the local tier is registered as the
    /// bus listener for this cache's name.
    pub fn build(self) -> Result<MultiTierCache<K, V>> {
        let config = self.config;
        config.validate()?;

        let key_codec = self.key_codec.ok_or_else(|| {
            CacheError::Configuration(format!("cache '{}': a key codec is required", config.name))
        })?;
        if self.remote.is_some() && self.value_codec.is_none() {
            return Err(CacheError::Configuration(format!(
                "cache '{}': a remote tier requires a value codec",
                config.name
            )));
        }
        if config.penetration_protect && self.lock.is_none() {
            return Err(CacheError::Configuration(format!(
                "cache '{}': penetration protection requires a distributed lock",
                config.name
            )));
        }

        let stats = Arc::new(StatsCounter::new());
        let local = Arc::new(LocalStore::new(
            config.local_capacity,
            config.expire_after_access,
            Arc::clone(&stats),
        )?);

        let guard = match (&self.lock, config.penetration_protect) {
            (Some(lock), true) => StampedeGuard::distributed(
                Arc::clone(lock),
                LockPolicy {
                    lease: config.lock_lease,
                    wait: config.lock_wait,
                    retry_delay: config.lock_retry_delay,
                },
            ),
            _ => StampedeGuard::local(),
        };
        let lock: Arc<dyn DistributedLock> = match self.lock {
            Some(lock) => lock,
            None => Arc::new(MemoryLock::new()),
        };

        if config.sync_local {
            if let Some(bus) = &self.bus {
                bus.register(&config.name, local.clone());
            }
        }

        info!(
            cache = %config.name,
            capacity = config.local_capacity,
            remote = self.remote.is_some(),
            penetration_protect = config.penetration_protect,
            write_through = config.write_through,
            async_write = config.async_write,
            sync_local = config.sync_local,
            "cache created"
        );

        Ok(MultiTierCache {
            write_permits: Arc::new(Semaphore::new(config.async_write_concurrency)),
            config,
            key_codec,
            value_codec: self.value_codec,
            local,
            remote: self.remote,
            bus: self.bus,
            lock,
            guard,
            loader: self.loader,
            stats,
        })
    }
}
