//! Redis lease lock (SET NX PX with a token-checked release).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::Pool;
use tracing::debug;

use super::{DistributedLock, LockHandle};
use crate::error::{CacheError, Result};
use crate::remote::redis::create_pool;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Deletes the key only while it still holds the caller's token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

fn lock_error(e: impl std::fmt::Display) -> CacheError {
    CacheError::LockUnavailable(e.to_string())
}

#[derive(Clone)]
pub struct RedisLock {
    pool: Pool,
}

impl RedisLock {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(create_pool(url)?))
    }

    async fn acquire(&self, key: &str, lease: Duration) -> Result<Option<LockHandle>> {
        let handle = LockHandle::new(key, lease);
        let mut conn = self.pool.get().await.map_err(lock_error)?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&handle.token)
            .arg("NX")
            .arg("PX")
            .arg((lease.as_millis() as u64).max(1))
            .query_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(reply.map(|_| handle))
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_lock(&self, key: &str, lease: Duration, wait: Duration) -> Result<Option<LockHandle>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(handle) = self.acquire(key, lease).await? {
                debug!(key = %key, "acquired redis lock");
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
        let mut conn = self.pool.get().await.map_err(lock_error)?;
        let released: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(&handle.key)
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(released == 1)
    }
}
