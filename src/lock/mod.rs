//! Distributed lock capability.
//!
//! Used by the stampede guard (cluster-wide load lock) and by the cache's
//! `try_lock` API. Every acquisition carries a unique token so a holder whose
//! lease expired can never release a lock someone else has since taken.

mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

pub use memory::MemoryLock;

/// Proof of a held lock; pass it back to `unlock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
    pub expires_at: Instant,
}

impl LockHandle {
    /// New handle with a fresh random token.
    pub fn new(key: impl Into<String>, lease: Duration) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            expires_at: Instant::now() + lease,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[async_trait]
pub trait DistributedLock: Send + Sync + 'static {
    /// Tries to take `key` for `lease`, waiting at most `wait`.
    ///
    /// `Ok(None)` means the lock was held by someone else until the deadline.
    /// `Err` means the lock service itself failed.
    async fn try_lock(&self, key: &str, lease: Duration, wait: Duration) -> Result<Option<LockHandle>>;

    /// Releases the lock if `handle` still owns it; returns whether it did.
    async fn unlock(&self, handle: &LockHandle) -> Result<bool>;
}
