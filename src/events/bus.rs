//! Event bus: publishes local mutations and applies foreign ones.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CacheEvent, CacheEventListener, PubSubTransport};
use crate::error::{CacheError, Result};

type ListenerMap = HashMap<String, Vec<Arc<dyn CacheEventListener>>>;

/// Event bus shared by every cache of one instance.
///
/// ## How It Works
///
/// 1. `publish` serializes an event and sends it on the shared channel
/// 2. `start` subscribes to the channel and spawns the dispatch loop
/// 3. Events whose `origin_id` is this instance are discarded
/// 4. Other events go to every listener registered for the event's cache name
/// 5. A lagging receiver or an empty payload from the transport means events
///    may have been lost, so every local tier is cleared
///
/// Publishing is best-effort: failures are logged and never reach the caller
/// that mutated the cache.
pub struct EventBus {
    instance_id: String,
    channel: String,
    transport: Arc<dyn PubSubTransport>,
    listeners: RwLock<ListenerMap>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(
        instance_id: impl Into<String>,
        channel: impl Into<String>,
        transport: Arc<dyn PubSubTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id: instance_id.into(),
            channel: channel.into(),
            transport,
            listeners: RwLock::new(HashMap::new()),
            task: Mutex::new(None),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    // == Listeners ==
    /// Adds a listener for events of `cache_name`.
    pub fn register(&self, cache_name: &str, listener: Arc<dyn CacheEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(cache_name.to_string())
            .or_default()
            .push(listener);
    }

    /// Drops every listener of `cache_name`; returns how many were removed.
    pub fn unregister(&self, cache_name: &str) -> usize {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cache_name)
            .map_or(0, |listeners| listeners.len())
    }

    pub fn listener_count(&self, cache_name: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cache_name)
            .map_or(0, Vec::len)
    }

    // == Publish ==
    /// Sends an event to sibling instances. Never fails the caller.
    pub async fn publish(&self, event: &CacheEvent) {
        if let Err(e) = self.try_publish(event).await {
            warn!(
                cache = %event.cache_name,
                key = ?event.key,
                event_type = ?event.event_type,
                error = %e,
                "failed to publish cache event"
            );
        }
    }

    async fn try_publish(&self, event: &CacheEvent) -> Result<()> {
        let payload = event
            .to_bytes()
            .map_err(|e| CacheError::EventDelivery(e.to_string()))?;
        self.transport.publish(&self.channel, payload).await?;
        debug!(
            cache = %event.cache_name,
            key = ?event.key,
            event_type = ?event.event_type,
            "published cache event"
        );
        Ok(())
    }

    // == Subscription ==
    /// Subscribes to the channel and spawns the dispatch loop.
    ///
    /// Calling it again while the loop is running is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let mut receiver = self.transport.subscribe(&self.channel).await?;
        info!(channel = %self.channel, instance = %self.instance_id, "subscribed to cache events");

        let bus: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let received = receiver.recv().await;
                let Some(bus) = bus.upgrade() else {
                    break;
                };
                match received {
                    Ok(payload) if payload.is_empty() => {
                        warn!(channel = %bus.channel, "event transport resubscribed, clearing local tiers");
                        bus.clear_all_local();
                    }
                    Ok(payload) => {
                        bus.dispatch(&payload);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event receiver lagged, clearing local tiers");
                        bus.clear_all_local();
                    }
                    Err(RecvError::Closed) => {
                        info!(channel = %bus.channel, "event channel closed");
                        break;
                    }
                }
            }
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the dispatch loop.
    pub fn shutdown(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
            info!(channel = %self.channel, "cache event subscription stopped");
        }
    }

    // == Dispatch ==
    /// Decodes a payload and applies it; returns the number of listeners that accepted it.
    pub fn dispatch(&self, payload: &[u8]) -> usize {
        match CacheEvent::from_bytes(payload) {
            Ok(event) => self.dispatch_event(&event),
            Err(e) => {
                warn!(error = %e, "failed to decode cache event");
                0
            }
        }
    }

    /// Applies a decoded event unless this instance produced it.
    pub fn dispatch_event(&self, event: &CacheEvent) -> usize {
        if event.origin_id == self.instance_id {
            return 0;
        }

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.cache_name)
            .cloned()
            .unwrap_or_default();

        let mut applied = 0;
        for listener in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => applied += 1,
                Ok(Err(e)) => {
                    warn!(cache = %event.cache_name, key = ?event.key, error = %e, "cache event listener failed");
                }
                Err(_) => {
                    error!(cache = %event.cache_name, key = ?event.key, "cache event listener panicked");
                }
            }
        }

        debug!(
            cache = %event.cache_name,
            key = ?event.key,
            event_type = ?event.event_type,
            origin = %event.origin_id,
            applied,
            "applied cache event"
        );
        applied
    }

    fn clear_all_local(&self) {
        let names: Vec<String> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for name in names {
            let clear = CacheEvent::new(name, None, super::CacheEventType::Clear, "resync");
            self.dispatch_event(&clear);
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}
