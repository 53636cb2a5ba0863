//! Redis remote tier.

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, Runtime};
use redis::AsyncCommands;
use tracing::debug;

use super::RemoteStore;
use crate::error::{CacheError, Result};

/// Keys deleted per SCAN page during `delete_by_prefix`.
const SCAN_BATCH: usize = 500;

/// Creates a connection pool for `url`.
pub fn create_pool(url: &str) -> Result<Pool> {
    deadpool_redis::Config::from_url(url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| CacheError::Configuration(format!("invalid redis url '{url}': {e}")))
}

pub(crate) fn unavailable(e: impl Display) -> CacheError {
    CacheError::RemoteUnavailable(e.to_string())
}

/// Escapes glob metacharacters so a prefix matches literally in SCAN MATCH.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

/// Remote tier stored in Redis; TTLs use millisecond expiry (PX).
#[derive(Clone)]
pub struct RedisRemoteStore {
    pool: Pool,
}

impl RedisRemoteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(create_pool(url)?))
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(unavailable)
    }
}

#[async_trait]
impl RemoteStore for RedisRemoteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(unavailable)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                let millis = (ttl.as_millis() as u64).max(1);
                conn.pset_ex::<_, _, ()>(key, value, millis)
                    .await
                    .map_err(unavailable)
            }
            None => conn.set::<_, _, ()>(key, value).await.map_err(unavailable),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let pattern = escape_glob(prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await.map_err(unavailable)?;
                removed += deleted;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, removed, "deleted remote namespace");
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.exists(key).await.map_err(unavailable)
    }
}
