//! Remote tier contract.
//!
//! The remote tier is a shared network cache visible to every instance. Any
//! call may fail with `CacheError::RemoteUnavailable`; the orchestrator decides
//! whether that degrades to a miss (reads) or a logged divergence (writes).
//! TTLs are `Duration`s and backends keep millisecond precision.

mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryRemoteStore;

#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value`; `ttl` of None keeps it until deleted.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Deletes every key starting with `prefix`; returns how many were removed.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;
}
