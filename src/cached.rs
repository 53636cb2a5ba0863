//! Cached function wrapper.
//!
//! Turns an async function into one whose results are kept in a
//! `MultiTierCache`, keyed by a caller-supplied key function.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{LoadFuture, MultiTierCache};
use crate::error::{BoxError, CacheError, Result};

type KeyFn<A, K> = Arc<dyn Fn(&A) -> K + Send + Sync>;
type Func<A, V> = Arc<dyn Fn(A) -> LoadFuture<V> + Send + Sync>;
type Condition<A> = Arc<dyn Fn(&A) -> bool + Send + Sync>;

/// Wraps `func` so calls go through `cache` under the key `key_fn(arg)`.
///
/// # Example
/// ```ignore
/// let find_order = cached(orders, |id: &u64| *id, |id: u64| async move {
///     db.find_order(id).await.map_err(Into::into)
/// })
/// .ttl(Duration::from_secs(60));
///
/// let order = find_order.call(42).await?;
/// ```
pub fn cached<A, K, V, KF, F, Fut>(cache: Arc<MultiTierCache<K, V>>, key_fn: KF, func: F) -> CachedFn<A, K, V>
where
    A: Send + 'static,
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    KF: Fn(&A) -> K + Send + Sync + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Option<V>, BoxError>> + Send + 'static,
{
    CachedFn {
        cache,
        key_fn: Arc::new(key_fn),
        func: Arc::new(move |arg: A| -> LoadFuture<V> { Box::pin(func(arg)) }),
        condition: None,
        ttl: None,
    }
}

pub struct CachedFn<A, K, V> {
    cache: Arc<MultiTierCache<K, V>>,
    key_fn: KeyFn<A, K>,
    func: Func<A, V>,
    condition: Option<Condition<A>>,
    ttl: Option<Duration>,
}

impl<A, K, V> Clone for CachedFn<A, K, V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            key_fn: Arc::clone(&self.key_fn),
            func: Arc::clone(&self.func),
            condition: self.condition.clone(),
            ttl: self.ttl,
        }
    }
}

impl<A, K, V> CachedFn<A, K, V>
where
    A: Send + 'static,
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Only arguments for which `condition` holds use the cache; others call straight through.
    pub fn when(mut self, condition: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// TTL for results stored by this wrapper, instead of the cache's expire-after-write.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn cache(&self) -> &Arc<MultiTierCache<K, V>> {
        &self.cache
    }

    /// Returns the cached result for `arg`, computing it at most once per key on a miss.
    pub async fn call(&self, arg: A) -> Result<Option<V>> {
        if !self.applies(&arg) {
            return (self.func)(arg).await.map_err(CacheError::loader);
        }
        let key = (self.key_fn)(&arg);
        let func = Arc::clone(&self.func);
        self.cache.compute(&key, move || func(arg), self.ttl).await
    }

    /// Drops the cached result for `arg`.
    pub async fn invalidate(&self, arg: &A) -> bool {
        self.cache.remove(&(self.key_fn)(arg)).await
    }

    /// Calls the function unconditionally and overwrites the cached result.
    pub async fn refresh(&self, arg: A) -> Result<Option<V>> {
        let key = (self.key_fn)(&arg);
        let cacheable = self.applies(&arg);
        let result = (self.func)(arg).await.map_err(CacheError::loader)?;
        if !cacheable {
            return Ok(result);
        }

        match (&result, self.ttl) {
            (Some(value), Some(ttl)) => self.cache.put_with_ttl(&key, value.clone(), ttl).await,
            (Some(value), None) => self.cache.put(&key, value.clone()).await,
            (None, _) if self.cache.config().cache_null_values => self.cache.put_absent(&key).await,
            (None, _) => {
                self.cache.remove(&key).await;
            }
        }
        Ok(result)
    }

    fn applies(&self, arg: &A) -> bool {
        self.condition.as_ref().map_or(true, |condition| condition(arg))
    }
}
