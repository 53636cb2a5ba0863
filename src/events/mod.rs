//! Cross-instance invalidation events.
//!
//! Every mutation produces a `CacheEvent`. The event bus ships it to sibling
//! instances, which invalidate their local tier so the next read refetches
//! from the remote tier.
//!
//! ```text
//! Instance 1: cache.put("k")
//!   ↓
//! Transport: PUBLISH tiercache:events {"cacheName":"orders","key":"k",...}
//!   ↓
//! Instance 2: EventBus receives → LocalStore("orders").invalidate("k")
//! Instance 1: EventBus receives → originId matches, discarded
//! ```

pub mod bus;
pub mod transport;

#[cfg(feature = "redis")]
pub mod redis;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use bus::EventBus;
pub use transport::{MemoryTransport, PubSubTransport};

/// Kind of mutation an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheEventType {
    Put,
    Remove,
    Clear,
}

/// Mutation notice exchanged between instances.
///
/// Wire shape is stable: `cacheName`, `key` (null for CLEAR), `eventType`,
/// `originId`, `timestamp` (Unix milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEvent {
    pub cache_name: String,
    pub key: Option<String>,
    pub event_type: CacheEventType,
    pub origin_id: String,
    pub timestamp: i64,
}

impl CacheEvent {
    pub fn new(
        cache_name: impl Into<String>,
        key: Option<String>,
        event_type: CacheEventType,
        origin_id: impl Into<String>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            key,
            event_type,
            origin_id: origin_id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Applies foreign events for one cache name.
///
/// Invalidation must be idempotent: delivery is at-least-once and unordered.
pub trait CacheEventListener: Send + Sync {
    fn on_event(&self, event: &CacheEvent) -> Result<()>;
}
