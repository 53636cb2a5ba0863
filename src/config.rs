//! Configuration Module
//!
//! Process-wide defaults loaded from environment variables, and the immutable
//! per-name `CacheConfig` every cache instance is created with.

use std::env;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{CacheError, Result};

/// Default lease for the distributed load lock.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(5);
/// Default deadline for acquiring the distributed load lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(100);
/// Pause before the single re-check when the load lock was not acquired.
pub const DEFAULT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Process-wide defaults shared by every cache created through a registry.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifies this process on the event bus
    pub instance_id: String,
    /// Default local tier capacity for new caches
    pub local_capacity: usize,
    /// Default expire-after-write in seconds, 0 = entries never expire
    pub expire_after_write: u64,
    /// Pub/sub channel carrying cache events
    pub event_channel: String,
    /// Background cleanup task interval in seconds
    pub cleanup_interval: u64,
    /// Stats report interval in seconds, 0 = disabled
    pub stats_interval: u64,
    /// Maximum in-flight asynchronous remote writes per cache
    pub async_write_concurrency: usize,
    /// Redis connection URL, None = in-memory backends
    pub redis_url: Option<String>,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `TIERCACHE_INSTANCE_ID` - Instance id (default: random UUID)
    /// - `TIERCACHE_LOCAL_CAPACITY` - Local tier entries (default: 1000)
    /// - `TIERCACHE_EXPIRE_AFTER_WRITE` - TTL in seconds (default: 300)
    /// - `TIERCACHE_EVENT_CHANNEL` - Event channel (default: tiercache:events)
    /// - `TIERCACHE_CLEANUP_INTERVAL` - Cleanup frequency in seconds (default: 1)
    /// - `TIERCACHE_STATS_INTERVAL` - Stats report frequency in seconds (default: 60)
    /// - `TIERCACHE_ASYNC_WRITE_CONCURRENCY` - Async write permits (default: 64)
    /// - `REDIS_URL` - Redis URL (default: unset)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            instance_id: env::var("TIERCACHE_INSTANCE_ID")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.instance_id),
            local_capacity: parse_env("TIERCACHE_LOCAL_CAPACITY").unwrap_or(defaults.local_capacity),
            expire_after_write: parse_env("TIERCACHE_EXPIRE_AFTER_WRITE")
                .unwrap_or(defaults.expire_after_write),
            event_channel: env::var("TIERCACHE_EVENT_CHANNEL").unwrap_or(defaults.event_channel),
            cleanup_interval: parse_env("TIERCACHE_CLEANUP_INTERVAL")
                .unwrap_or(defaults.cleanup_interval),
            stats_interval: parse_env("TIERCACHE_STATS_INTERVAL").unwrap_or(defaults.stats_interval),
            async_write_concurrency: parse_env("TIERCACHE_ASYNC_WRITE_CONCURRENCY")
                .unwrap_or(defaults.async_write_concurrency),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
        }
    }

    /// Rejects values no cache could be created with.
    pub fn validate(&self) -> Result<()> {
        if self.local_capacity == 0 {
            return Err(CacheError::Configuration(
                "local capacity must be greater than zero".to_string(),
            ));
        }
        if self.async_write_concurrency == 0 {
            return Err(CacheError::Configuration(
                "async write concurrency must be greater than zero".to_string(),
            ));
        }
        if self.event_channel.is_empty() {
            return Err(CacheError::Configuration("event channel must not be empty".to_string()));
        }
        if self.cleanup_interval == 0 {
            return Err(CacheError::Configuration(
                "cleanup interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Default expire-after-write as a Duration.
    pub fn default_expire_after_write(&self) -> Option<Duration> {
        (self.expire_after_write > 0).then(|| Duration::from_secs(self.expire_after_write))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            local_capacity: 1000,
            expire_after_write: 300,
            event_channel: "tiercache:events".to_string(),
            cleanup_interval: 1,
            stats_interval: 60,
            async_write_concurrency: 64,
            redis_url: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

// == Cache Config ==
/// Immutable configuration of one named cache.
///
/// Resolved once by `CacheBuilder::build`; changing it means recreating the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub name: String,
    /// Deadline measured from the write
    pub expire_after_write: Option<Duration>,
    /// Idle deadline, refreshed by every local read
    pub expire_after_access: Option<Duration>,
    /// Upper bound for local tier TTLs (promotions use it as their TTL)
    pub local_expire: Option<Duration>,
    pub local_capacity: usize,
    pub cache_null_values: bool,
    pub penetration_protect: bool,
    pub write_through: bool,
    pub async_write: bool,
    pub sync_local: bool,
    pub load_timeout: Option<Duration>,
    pub lock_lease: Duration,
    pub lock_wait: Duration,
    pub lock_retry_delay: Duration,
    pub async_write_concurrency: usize,
}

impl CacheConfig {
    /// Config for `name` with the process-wide defaults applied.
    pub fn from_defaults(name: impl Into<String>, defaults: &Config) -> Self {
        Self {
            name: name.into(),
            expire_after_write: defaults.default_expire_after_write(),
            expire_after_access: None,
            local_expire: None,
            local_capacity: defaults.local_capacity,
            cache_null_values: false,
            penetration_protect: false,
            write_through: false,
            async_write: false,
            sync_local: true,
            load_timeout: None,
            lock_lease: DEFAULT_LOCK_LEASE,
            lock_wait: DEFAULT_LOCK_WAIT,
            lock_retry_delay: DEFAULT_LOCK_RETRY_DELAY,
            async_write_concurrency: defaults.async_write_concurrency,
        }
    }

    /// Checks the invariants every cache relies on.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CacheError::Configuration("cache name must not be empty".to_string()));
        }
        if self.local_capacity == 0 {
            return Err(CacheError::Configuration(format!(
                "cache '{}': local capacity must be greater than zero",
                self.name
            )));
        }
        if self.async_write_concurrency == 0 {
            return Err(CacheError::Configuration(format!(
                "cache '{}': async write concurrency must be greater than zero",
                self.name
            )));
        }
        let durations = [
            ("expire_after_write", self.expire_after_write),
            ("expire_after_access", self.expire_after_access),
            ("local_expire", self.local_expire),
            ("load_timeout", self.load_timeout),
            ("lock_lease", Some(self.lock_lease)),
            ("lock_wait", Some(self.lock_wait)),
        ];
        for (field, value) in durations {
            if value == Some(Duration::ZERO) {
                return Err(CacheError::Configuration(format!(
                    "cache '{}': {} must be greater than zero",
                    self.name, field
                )));
            }
        }
        Ok(())
    }

    /// TTL for a local write: the explicit TTL (or expire-after-write), capped by `local_expire`.
    pub fn local_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        let ttl = ttl.or(self.expire_after_write);
        match (ttl, self.local_expire) {
            (Some(ttl), Some(cap)) => Some(ttl.min(cap)),
            (None, cap) => cap,
            (ttl, None) => ttl,
        }
    }

    /// TTL for a remote write.
    pub fn remote_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        ttl.or(self.expire_after_write)
    }

    /// Key prefix owning this cache's namespace in the remote tier.
    pub fn remote_prefix(&self) -> String {
        format!("{}:", self.name)
    }

    /// Name of the user lock guarding `key`, outside the data namespace.
    pub fn lock_key(&self, key: &str) -> String {
        format!("lock:{}:{}", self.name, key)
    }

    /// Name of the cluster-wide lease taken while loading `key`.
    pub fn load_lock_key(&self, key: &str) -> String {
        format!("load:{}:{}", self.name, key)
    }
}
