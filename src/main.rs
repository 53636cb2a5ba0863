//! tiercache demo
//!
//! Runs two cache instances against shared backends and drives a small
//! read-mostly workload through them until interrupted. With the `redis`
//! feature and `REDIS_URL` set, both instances use Redis; otherwise they
//! share in-process backends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiercache::{
    spawn_cleanup_task, spawn_stats_reporter, BoxError, CacheRegistry, Config, DisplayKeyCodec,
    JsonCodec, MultiTierCache,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: u64,
    status: String,
    revision: u64,
}

type Orders = MultiTierCache<u64, Order>;

/// Stand-in for a slow system of record.
#[derive(Default)]
struct OrderDb {
    queries: AtomicU64,
    revision: AtomicU64,
}

impl OrderDb {
    async fn find(&self, id: u64) -> Result<Option<Order>, BoxError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Every tenth id does not exist
        if id % 10 == 0 {
            return Ok(None);
        }
        Ok(Some(Order {
            id,
            status: "created".to_string(),
            revision: self.revision.load(Ordering::Relaxed),
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" for this crate, can be overridden with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tiercache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tiercache demo");

    let config = Config::from_env();
    config.validate().context("invalid configuration")?;
    info!(
        instance = %config.instance_id,
        local_capacity = config.local_capacity,
        expire_after_write = config.expire_after_write,
        cleanup_interval = config.cleanup_interval,
        redis = config.redis_url.is_some(),
        "Configuration loaded"
    );

    let (node_a, node_b) = build_registries(&config)?;
    node_a.start().await.context("failed to start event subscription")?;
    node_b.start().await.context("failed to start event subscription")?;

    let orders_a = open_orders(&node_a)?;
    let orders_b = open_orders(&node_b)?;

    let mut tasks = vec![spawn_cleanup_task(
        node_a.clone(),
        Duration::from_secs(config.cleanup_interval),
    )];
    if config.stats_interval > 0 {
        tasks.push(spawn_stats_reporter(
            node_a.clone(),
            Duration::from_secs(config.stats_interval),
        ));
    }

    let db = Arc::new(OrderDb::default());
    tasks.push(tokio::spawn(read_workload(orders_a, db.clone())));
    tasks.push(tokio::spawn(write_workload(orders_b, db.clone())));
    info!("Workload running, press Ctrl+C to stop");

    shutdown_signal().await;

    for task in &tasks {
        task.abort();
    }
    node_a.shutdown();
    node_b.shutdown();
    info!(db_queries = db.queries.load(Ordering::Relaxed), "Demo shutdown complete");
    Ok(())
}

#[cfg(feature = "redis")]
fn build_registries(config: &Config) -> anyhow::Result<(Arc<CacheRegistry>, Arc<CacheRegistry>)> {
    use tiercache::events::redis::RedisTransport;
    use tiercache::lock::redis::RedisLock;
    use tiercache::remote::redis::{create_pool, RedisRemoteStore};

    let Some(url) = config.redis_url.as_deref() else {
        return Ok(in_memory_registries(config));
    };

    let node = |instance_id: String| -> anyhow::Result<Arc<CacheRegistry>> {
        let pool = create_pool(url)?;
        let config = Config {
            instance_id,
            ..config.clone()
        };
        Ok(Arc::new(
            CacheRegistry::new(config)
                .with_remote(Arc::new(RedisRemoteStore::new(pool.clone())))
                .with_lock(Arc::new(RedisLock::new(pool.clone())))
                .with_transport(Arc::new(RedisTransport::new(pool, url))),
        ))
    };
    info!("Using redis backends");
    Ok((
        node(format!("{}-a", config.instance_id))?,
        node(format!("{}-b", config.instance_id))?,
    ))
}

#[cfg(not(feature = "redis"))]
fn build_registries(config: &Config) -> anyhow::Result<(Arc<CacheRegistry>, Arc<CacheRegistry>)> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but the redis feature is disabled, using in-memory backends");
    }
    Ok(in_memory_registries(config))
}

fn in_memory_registries(config: &Config) -> (Arc<CacheRegistry>, Arc<CacheRegistry>) {
    let shared = (
        Arc::new(tiercache::MemoryRemoteStore::new()),
        Arc::new(tiercache::MemoryLock::new()),
        Arc::new(tiercache::MemoryTransport::new()),
    );
    let node = |suffix: &str| {
        let config = Config {
            instance_id: format!("{}-{suffix}", config.instance_id),
            ..config.clone()
        };
        Arc::new(CacheRegistry::in_memory(config, Some(shared.clone())))
    };
    (node("a"), node("b"))
}

fn open_orders(registry: &CacheRegistry) -> anyhow::Result<Arc<Orders>> {
    let orders = registry.get_or_create::<u64, Order, _>("orders", |builder| {
        builder
            .key_codec(DisplayKeyCodec)
            .value_codec(JsonCodec::new())
            .cache_null_values(true)
            .penetration_protect(true)
            .expire_after_write(Duration::from_secs(30))
            .local_expire(Duration::from_secs(10))
    })?;
    Ok(orders)
}

/// Reads a small hot set of orders; misses are loaded once per key.
async fn read_workload(orders: Arc<Orders>, db: Arc<OrderDb>) {
    let mut tick: u64 = 0;
    loop {
        tick += 1;
        let id = tick % 25 + 1;
        let db = db.clone();
        match orders.compute_if_absent(&id, move || async move { db.find(id).await }).await {
            Ok(Some(order)) if tick % 50 == 0 => {
                info!(id, revision = order.revision, status = %order.status, "read order");
            }
            Ok(_) => {}
            Err(e) => warn!(id, error = %e, "order lookup failed"),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Periodically updates an order on the other instance, invalidating the reader's local tier.
async fn write_workload(orders: Arc<Orders>, db: Arc<OrderDb>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3));
    loop {
        ticker.tick().await;
        let revision = db.revision.fetch_add(1, Ordering::Relaxed) + 1;
        let id = revision % 25 + 1;
        let order = Order {
            id,
            status: "updated".to_string(),
            revision,
        };
        orders.put(&id, order).await;
        info!(id, revision, "updated order");
    }
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
