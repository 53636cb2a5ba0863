//! Pub/sub transport carrying serialized events between instances.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::Result;

/// Default buffer per channel; slow receivers beyond it lag and lose events.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Publish/subscribe primitive offered by the shared infrastructure.
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Receiver of every payload published on `channel` after this call.
    ///
    /// A transport that may have dropped payloads, for example across a
    /// reconnect, delivers an empty payload once it is receiving again.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>>;
}

/// In-process transport; instances sharing one `Arc<MemoryTransport>` see each
/// other's events.
#[derive(Debug)]
pub struct MemoryTransport {
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    capacity: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        // No subscribers is not an error for a broadcast
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>> {
        Ok(self.sender(channel).subscribe())
    }
}
