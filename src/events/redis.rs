//! Redis pub/sub transport.

use std::convert::Infallible;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use deadpool_redis::Pool;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::PubSubTransport;
use crate::error::{CacheError, Result};
use crate::remote::redis::{create_pool, unavailable};

const BUFFER_SIZE: usize = 1024;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Transport publishing through a pooled connection and receiving on a
/// dedicated pub/sub connection per channel.
///
/// Each subscribed channel gets one forwarding task that reconnects with
/// exponential backoff; events published while it is disconnected are lost.
pub struct RedisTransport {
    pool: Pool,
    url: String,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisTransport {
    pub fn new(pool: Pool, url: impl Into<String>) -> Self {
        Self {
            pool,
            url: url.into(),
            channels: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(create_pool(url)?, url))
    }

    fn spawn_forwarder(&self, channel: String, sender: broadcast::Sender<Vec<u8>>) -> JoinHandle<()> {
        let url = self.url.clone();
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            let mut reconnecting = false;
            loop {
                match forward(&url, &channel, &sender, &mut backoff, reconnecting).await {
                    Ok(never) => match never {},
                    Err(e) => {
                        error!(
                            channel = %channel,
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "event subscription lost, reconnecting"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        reconnecting = true;
                    }
                }
            }
        })
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Forwards messages until the connection drops.
///
/// Resets `backoff` once subscribed. After a reconnect it sends an empty
/// payload so subscribers know events may have been missed.
async fn forward(
    url: &str,
    channel: &str,
    sender: &broadcast::Sender<Vec<u8>>,
    backoff: &mut Duration,
    reconnecting: bool,
) -> Result<Infallible> {
    let client = redis::Client::open(url).map_err(unavailable)?;
    let mut pubsub = client.get_async_pubsub().await.map_err(unavailable)?;
    pubsub.subscribe(channel).await.map_err(unavailable)?;
    info!(channel = %channel, "subscribed to redis channel");
    *backoff = INITIAL_BACKOFF;
    if reconnecting {
        let _ = sender.send(Vec::new());
    }

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        match message.get_payload::<Vec<u8>>() {
            Ok(payload) => {
                // No local receivers is fine
                let _ = sender.send(payload);
            }
            Err(e) => debug!(channel = %channel, error = %e, "unreadable pub/sub payload"),
        }
    }
    Err(CacheError::RemoteUnavailable("pub/sub connection closed".to_string()))
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(unavailable)?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(unavailable)
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>> {
        let receiver = match self.channels.entry(channel.to_string()) {
            Entry::Occupied(existing) => existing.get().subscribe(),
            Entry::Vacant(slot) => {
                let (sender, receiver) = broadcast::channel(BUFFER_SIZE);
                let task = self.spawn_forwarder(channel.to_string(), sender.clone());
                self.tasks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(task);
                slot.insert(sender);
                receiver
            }
        };
        Ok(receiver)
    }
}

impl Drop for RedisTransport {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}
