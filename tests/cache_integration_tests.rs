//! Integration tests for the multi-tier cache
//!
//! Drives the public API against the in-memory remote tier and lock, plus
//! small failing fakes for the degraded paths.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_test::assert_ok;

use tiercache::{
    BoxError, CacheBuilder, CacheError, DisplayKeyCodec, DistributedLock, JsonCodec, LockHandle,
    MemoryLock, MemoryRemoteStore, MultiTierCache, Result,
};

// == Helper Functions ==

fn local_only(name: &str, capacity: usize) -> MultiTierCache<String, String> {
    CacheBuilder::new(name)
        .key_codec(DisplayKeyCodec)
        .local_capacity(capacity)
        .build()
        .unwrap()
}

fn with_remote(name: &str, remote: &Arc<MemoryRemoteStore>) -> CacheBuilder<u64, String> {
    CacheBuilder::new(name)
        .key_codec(DisplayKeyCodec)
        .value_codec(JsonCodec::new())
        .remote(remote.clone())
}

type LoadFut = Pin<Box<dyn Future<Output = std::result::Result<Option<String>, BoxError>> + Send>>;

/// Loader counting its invocations and answering `value-{key}` after `delay`.
fn counting_loader(calls: &Arc<AtomicUsize>, key: u64, delay: Duration) -> impl FnOnce() -> LoadFut + Send {
    let calls = Arc::clone(calls);
    move || -> LoadFut {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(Some(format!("value-{key}")))
        })
    }
}

/// Lock service that is always down.
struct UnavailableLock;

#[async_trait]
impl DistributedLock for UnavailableLock {
    async fn try_lock(&self, _key: &str, _lease: Duration, _wait: Duration) -> Result<Option<LockHandle>> {
        Err(CacheError::LockUnavailable("lock service unreachable".to_string()))
    }

    async fn unlock(&self, _handle: &LockHandle) -> Result<bool> {
        Err(CacheError::LockUnavailable("lock service unreachable".to_string()))
    }
}

// == Round Trip ==

#[tokio::test]
async fn test_put_then_get_round_trip() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache = with_remote("orders", &remote).build().unwrap();

    for id in 1..=20u64 {
        cache.put(&id, format!("order-{id}")).await;
    }
    for id in 1..=20u64 {
        assert_eq!(cache.get(&id).await.unwrap(), Some(format!("order-{id}")));
    }
    assert_eq!(remote.len(), 20);
    assert_eq!(cache.name(), "orders");
}

#[tokio::test]
async fn test_remove_then_get_is_miss() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache = with_remote("orders", &remote).build().unwrap();

    cache.put(&1, "one".to_string()).await;
    assert!(cache.remove(&1).await, "key existed in the remote tier");
    assert_eq!(cache.get(&1).await.unwrap(), None);

    // Removing a key that was never there
    assert!(!cache.remove(&2).await);
    assert_eq!(cache.get(&2).await.unwrap(), None);
    assert!(remote.is_empty());
}

#[tokio::test]
async fn test_remote_value_is_promoted_to_local() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let writer = with_remote("orders", &remote).build().unwrap();
    let reader = with_remote("orders", &remote).build().unwrap();

    writer.put(&7, "seven".to_string()).await;
    assert_eq!(reader.local_size(), 0);

    assert_eq!(reader.get(&7).await.unwrap(), Some("seven".to_string()));
    assert_eq!(reader.local_size(), 1);
    assert_eq!(reader.get(&7).await.unwrap(), Some("seven".to_string()));

    let stats = reader.stats();
    assert_eq!(stats.remote_hits, 1);
    assert_eq!(stats.local_hits, 1);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 0);
}

// == Stampede Protection ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_compute_if_absent_loads_once() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache = Arc::new(with_remote("orders", &remote).build().unwrap());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let cache = Arc::clone(&cache);
        let loader = counting_loader(&calls, 42, Duration::from_millis(100));
        tasks.push(tokio::spawn(async move { cache.compute_if_absent(&42, loader).await }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), Some("value-42".to_string()));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().load_success, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_all_see_loader_failure() {
    let cache = Arc::new(
        CacheBuilder::<u64, String>::new("orders")
            .key_codec(DisplayKeyCodec)
            .build()
            .unwrap(),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tasks.push(tokio::spawn(async move {
            cache
                .compute_if_absent(&1, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Err::<Option<String>, BoxError>("database offline".into())
                })
                .await
        }));
    }

    for task in tasks {
        assert!(matches!(task.await.unwrap(), Err(CacheError::Loader(_))));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Failures are never cached
    assert_eq!(cache.local_size(), 0);
    let stats = cache.stats();
    assert_eq!(stats.load_failure, 1);
    assert_eq!(stats.load_success, 0);
}

#[tokio::test]
async fn test_penetration_protect_with_unavailable_lock_returns_miss() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let cache = CacheBuilder::<u64, String>::new("orders")
        .key_codec(DisplayKeyCodec)
        .penetration_protect(true)
        .lock(Arc::new(UnavailableLock))
        .loader(move |id: &u64| {
            let id = *id;
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Some(format!("order-{id}"))) }
        })
        .build()
        .unwrap();

    let result = assert_ok!(cache.get(&5).await);
    assert_eq!(result, None);
    assert_eq!(calls.load(Ordering::SeqCst), 0, "loader must not run without the lock");
}

#[tokio::test]
async fn test_busy_distributed_lock_bounds_the_wait() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let lock = Arc::new(MemoryLock::new());
    let node = |lock: &Arc<MemoryLock>| {
        Arc::new(
            with_remote("orders", &remote)
                .penetration_protect(true)
                .lock(lock.clone())
                .lock_wait(Duration::from_millis(50))
                .lock_retry_delay(Duration::from_millis(20))
                .build()
                .unwrap(),
        )
    };
    let node_a = node(&lock);
    let node_b = node(&lock);
    let calls = Arc::new(AtomicUsize::new(0));

    let slow = {
        let node_a = Arc::clone(&node_a);
        let loader = counting_loader(&calls, 9, Duration::from_millis(400));
        tokio::spawn(async move { node_a.compute_if_absent(&9, loader).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    let loader = counting_loader(&calls, 9, Duration::ZERO);
    assert_eq!(node_b.compute_if_absent(&9, loader).await.unwrap(), None);
    assert!(started.elapsed() < Duration::from_millis(300));

    assert_eq!(slow.await.unwrap().unwrap(), Some("value-9".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "only the lock holder loads");

    // Once populated, the other node reads it from the remote tier
    assert_eq!(node_b.get(&9).await.unwrap(), Some("value-9".to_string()));
}

#[tokio::test]
async fn test_load_timeout() {
    let cache = CacheBuilder::<u64, String>::new("orders")
        .key_codec(DisplayKeyCodec)
        .load_timeout(Duration::from_millis(30))
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = cache
        .compute_if_absent(&1, counting_loader(&calls, 1, Duration::from_secs(5)))
        .await;
    assert!(matches!(result, Err(CacheError::LoadTimeout(_))));
    assert_eq!(cache.stats().load_failure, 1);
}

#[tokio::test]
async fn test_compute_after_remove_runs_new_loader() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache = Arc::new(with_remote("orders", &remote).build().unwrap());
    let calls = Arc::new(AtomicUsize::new(0));

    // Joins the first load and keeps its slot alive past the load
    let waiter = {
        let cache = Arc::clone(&cache);
        let loader = counting_loader(&calls, 1, Duration::ZERO);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.compute_if_absent(&1, loader).await
        })
    };

    let first = cache
        .compute_if_absent(&1, || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Some("v1".to_string()))
        })
        .await;
    assert_eq!(first.unwrap(), Some("v1".to_string()));
    assert!(cache.remove(&1).await);

    let second = cache
        .compute_if_absent(&1, || async { Ok(Some("v2".to_string())) })
        .await;
    assert_eq!(second.unwrap(), Some("v2".to_string()));
    assert_eq!(cache.get(&1).await.unwrap(), Some("v2".to_string()));

    assert_eq!(waiter.await.unwrap().unwrap(), Some("v1".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 0, "the waiter shared the first load");
}

#[tokio::test]
async fn test_failed_load_is_not_replayed_to_later_callers() {
    let cache = local_only("orders", 10);
    let key = "k".to_string();

    let failed = cache
        .compute_if_absent(&key, || async { Err::<Option<String>, BoxError>("db down".into()) })
        .await;
    assert!(matches!(failed, Err(CacheError::Loader(_))));

    let retried = cache
        .compute_if_absent(&key, || async { Ok(Some("recovered".to_string())) })
        .await;
    assert_eq!(retried.unwrap(), Some("recovered".to_string()));
}

// == Capacity and TTL ==

#[tokio::test]
async fn test_local_capacity_is_never_exceeded() {
    let cache = local_only("bounded", 5);

    for i in 0..12 {
        cache.put(&format!("key-{i}"), format!("value-{i}")).await;
        assert!(cache.local_size() <= 5);
    }
    assert_eq!(cache.local_size(), 5);
    assert_eq!(cache.stats().evictions, 7);
}

#[tokio::test]
async fn test_orders_capacity_two_evicts_least_recently_used() {
    let cache = local_only("orders", 2);
    let (a, b, c) = ("A".to_string(), "B".to_string(), "C".to_string());

    cache.put(&a, "a".to_string()).await;
    cache.put(&b, "b".to_string()).await;
    cache.put(&c, "c".to_string()).await;

    assert_eq!(cache.local_size(), 2);
    assert_eq!(cache.get(&a).await.unwrap(), None);
    assert_eq!(cache.get(&b).await.unwrap(), Some("b".to_string()));
    assert_eq!(cache.get(&c).await.unwrap(), Some("c".to_string()));
}

#[tokio::test]
async fn test_expire_after_write() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache = with_remote("orders", &remote)
        .expire_after_write(Duration::from_millis(100))
        .build()
        .unwrap();

    cache.put(&1, "short".to_string()).await;
    cache
        .put_with_ttl(&2, "long".to_string(), Duration::from_secs(60))
        .await;
    assert_eq!(cache.get(&1).await.unwrap(), Some("short".to_string()));

    tokio::time::sleep(Duration::from_millis(150)).await;

    // Expired in both tiers
    assert_eq!(cache.get(&1).await.unwrap(), None);
    assert_eq!(cache.get(&2).await.unwrap(), Some("long".to_string()));
}

#[tokio::test]
async fn test_compute_if_absent_with_ttl_overrides_default() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache = with_remote("orders", &remote)
        .expire_after_write(Duration::from_secs(60))
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let loaded = cache
        .compute_if_absent_with_ttl(&1, counting_loader(&calls, 1, Duration::ZERO), Duration::from_millis(80))
        .await;
    assert_eq!(loaded.unwrap(), Some("value-1".to_string()));
    cache
        .compute_if_absent(&2, counting_loader(&calls, 2, Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(cache.get(&1).await.unwrap(), Some("value-1".to_string()));

    tokio::time::sleep(Duration::from_millis(150)).await;

    // Gone from both tiers while the default TTL still holds the other key
    assert_eq!(cache.get(&1).await.unwrap(), None);
    assert!(!cache.contains_key(&1).await);
    assert_eq!(cache.get(&2).await.unwrap(), Some("value-2".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_expire_after_access_keeps_hot_entries() {
    let cache = CacheBuilder::<u64, String>::new("sessions")
        .key_codec(DisplayKeyCodec)
        .no_expiry()
        .expire_after_access(Duration::from_millis(200))
        .build()
        .unwrap();

    cache.put(&1, "hot".to_string()).await;
    cache.put(&2, "cold".to_string()).await;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.get(&1).await.unwrap().is_some());
    }

    assert_eq!(cache.get(&2).await.unwrap(), None);
    assert_eq!(cache.get(&1).await.unwrap(), Some("hot".to_string()));
}

// == Null Caching ==

#[tokio::test]
async fn test_cached_absence_skips_loader() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache = with_remote("users", &remote)
        .cache_null_values(true)
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = Arc::clone(&calls);
        let result = cache
            .compute_if_absent(&404, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.contains_key(&404).await);
    // The marker survives the trip through the remote tier
    let peer = with_remote("users", &remote).build().unwrap();
    assert!(peer.contains_key(&404).await);
    assert_eq!(peer.get(&404).await.unwrap(), None);
    assert_eq!(peer.stats().remote_hits, 1);
}

#[tokio::test]
async fn test_absence_not_cached_by_default() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache = with_remote("users", &remote).build().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = Arc::clone(&calls);
        cache
            .compute_if_absent(&404, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!cache.contains_key(&404).await);

    // Explicitly putting an absence is also a no-op
    cache.put_absent(&404).await;
    assert!(remote.is_empty());
}

// == Degraded Remote Tier ==

#[tokio::test]
async fn test_write_through_async_write_survives_remote_failure() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_available(false);
    let cache = with_remote("orders", &remote)
        .write_through(true)
        .async_write(true)
        .build()
        .unwrap();

    cache.put(&1, "kept locally".to_string()).await;
    assert_eq!(cache.get(&1).await.unwrap(), Some("kept locally".to_string()));

    // The failure only shows up in the counters
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.stats().remote_failures >= 1);
}

#[tokio::test]
async fn test_remote_read_failure_degrades_to_loader() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache = with_remote("orders", &remote).build().unwrap();
    remote.set_available(false);
    let calls = Arc::new(AtomicUsize::new(0));

    let value = cache
        .compute_if_absent(&3, counting_loader(&calls, 3, Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(value, Some("value-3".to_string()));
    assert_eq!(cache.get(&3).await.unwrap(), Some("value-3".to_string()));

    // remove falls back to the local answer
    assert!(cache.remove(&3).await);
    assert!(cache.stats().remote_failures >= 3);
}

#[tokio::test]
async fn test_clear_only_touches_own_namespace() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let orders = with_remote("orders", &remote).build().unwrap();
    let users = with_remote("users", &remote).build().unwrap();

    orders.put(&1, "order".to_string()).await;
    users.put(&1, "user".to_string()).await;

    orders.clear().await;

    assert_eq!(orders.local_size(), 0);
    assert_eq!(orders.get(&1).await.unwrap(), None);
    assert_eq!(users.get(&1).await.unwrap(), Some("user".to_string()));
    assert_eq!(remote.len(), 1);
}

// == Locks ==

#[tokio::test]
async fn test_try_lock_excludes_other_holders() {
    let lock = Arc::new(MemoryLock::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    let node_a = with_remote("jobs", &remote).lock(lock.clone()).build().unwrap();
    let node_b = with_remote("jobs", &remote)
        .lock(lock.clone())
        .lock_wait(Duration::from_millis(10))
        .build()
        .unwrap();

    let handle = node_a.try_lock(&1, Duration::from_secs(5)).await.unwrap();
    assert!(node_b.try_lock(&1, Duration::from_secs(5)).await.is_none());
    assert!(node_b.try_lock(&2, Duration::from_secs(5)).await.is_some());

    assert!(node_a.unlock(&handle).await);
    assert!(node_b.try_lock(&1, Duration::from_secs(5)).await.is_some());
}

#[tokio::test]
async fn test_lock_keys_stay_out_of_the_data_namespace() {
    let lock = Arc::new(MemoryLock::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache = Arc::new(
        with_remote("orders", &remote)
            .penetration_protect(true)
            .lock(lock.clone())
            .build()
            .unwrap(),
    );

    let handle = cache.try_lock(&1, Duration::from_secs(5)).await.unwrap();
    assert_eq!(handle.key, "lock:orders:1");
    assert!(!cache.contains_key(&1).await);

    // Clearing the data does not release a held lock
    cache.clear().await;
    assert!(lock.is_locked("lock:orders:1"));
    assert!(cache.unlock(&handle).await);

    let loading = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            cache
                .compute_if_absent(&9, || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(Some("nine".to_string()))
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(lock.is_locked("load:orders:9"));
    assert!(remote.is_empty(), "the load lease is not stored as data");

    assert_eq!(loading.await.unwrap().unwrap(), Some("nine".to_string()));
    assert!(!lock.is_locked("load:orders:9"));
}

#[tokio::test]
async fn test_try_lock_and_run() {
    let cache = CacheBuilder::<u64, String>::new("jobs")
        .key_codec(DisplayKeyCodec)
        .lock_wait(Duration::from_millis(10))
        .build()
        .unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    let ran = cache
        .try_lock_and_run(&1, Duration::from_secs(5), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    assert!(ran);

    // Released afterwards, so it can be taken again
    let held = cache.try_lock(&1, Duration::from_secs(5)).await.unwrap();
    let counter = Arc::clone(&runs);
    let ran = cache
        .try_lock_and_run(&1, Duration::from_secs(5), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    assert!(!ran);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(cache.unlock(&held).await);
}

#[tokio::test]
async fn test_try_lock_with_unavailable_service_is_false() {
    let cache = CacheBuilder::<u64, String>::new("jobs")
        .key_codec(DisplayKeyCodec)
        .lock(Arc::new(UnavailableLock))
        .build()
        .unwrap();

    assert!(cache.try_lock(&1, Duration::from_secs(1)).await.is_none());
    assert!(!cache.try_lock_and_run(&1, Duration::from_secs(1), || async {}).await);
}

// == Stats ==

#[tokio::test]
async fn test_stats_track_requests_and_reset() {
    let cache = local_only("stats", 10);
    let key = "k".to_string();

    assert_eq!(cache.stats().hit_rate(), 0.0);
    assert_eq!(cache.get(&key).await.unwrap(), None);
    cache.put(&key, "v".to_string()).await;
    cache.get(&key).await.unwrap();
    cache.get(&key).await.unwrap();

    let stats = cache.stats();
    assert_eq!(stats.requests, 3);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    assert_eq!(stats.total_entries, 1);

    cache.reset_stats();
    let stats = cache.stats();
    assert_eq!(stats.requests, 0);
    assert_eq!(stats.total_entries, 1);
}
