//! tiercache - a multi-tier cache engine
//!
//! A bounded local LRU/TTL tier in front of a shared remote tier, with
//! single-flight loading, an optional distributed load lock, and pub/sub
//! invalidation keeping every instance's local tier coherent.

pub mod cache;
pub mod cached;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod lock;
pub mod registry;
pub mod remote;
pub mod tasks;

pub use cache::{CacheBuilder, CacheStats, CacheValue, MultiTierCache};
pub use cached::{cached, CachedFn};
pub use codec::{BytesCodec, DisplayKeyCodec, JsonCodec, KeyCodec, ValueCodec};
pub use config::{CacheConfig, Config};
pub use error::{BoxError, CacheError, Result};
pub use events::{CacheEvent, CacheEventListener, CacheEventType, EventBus, MemoryTransport, PubSubTransport};
pub use lock::{DistributedLock, LockHandle, MemoryLock};
pub use registry::CacheRegistry;
pub use remote::{MemoryRemoteStore, RemoteStore};
pub use tasks::{spawn_cleanup_task, spawn_stats_reporter};
