//! Cache Entry Module
//!
//! Defines local tier entries with write and access deadlines, and the
//! value wrapper that distinguishes a cached absence from a missing key.

use std::time::{Duration, Instant};

// == Cache Value ==
/// A value held by a tier.
///
/// `Null` is the cached-absence marker: the loader legitimately produced no
/// value and the cache remembers that instead of calling the loader again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue<V> {
    Present(V),
    Null,
}

impl<V> CacheValue<V> {
    pub fn is_null(&self) -> bool {
        matches!(self, CacheValue::Null)
    }

    /// Collapses the marker back to what callers see.
    pub fn into_option(self) -> Option<V> {
        match self {
            CacheValue::Present(v) => Some(v),
            CacheValue::Null => None,
        }
    }
}

impl<V> From<Option<V>> for CacheValue<V> {
    fn from(value: Option<V>) -> Self {
        match value {
            Some(v) => CacheValue::Present(v),
            None => CacheValue::Null,
        }
    }
}

// == Cache Entry ==
/// A single local tier entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The stored value
    pub value: CacheValue<V>,
    /// Insertion time
    pub created_at: Instant,
    /// Hard deadline measured from the write, None = no write expiry
    pub write_deadline: Option<Instant>,
    /// Idle deadline pushed forward by reads, None = no access expiry
    pub access_deadline: Option<Instant>,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates an entry expiring `ttl` after now and/or after `idle` without reads.
    pub fn new(value: CacheValue<V>, ttl: Option<Duration>, idle: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            write_deadline: ttl.map(|ttl| now + ttl),
            access_deadline: idle.map(|idle| now + idle),
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once the current time reaches either deadline.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        let past = |deadline: Option<Instant>| deadline.is_some_and(|d| now >= d);
        past(self.write_deadline) || past(self.access_deadline)
    }

    /// Pushes the idle deadline forward after a read.
    pub fn touch(&mut self, idle: Option<Duration>) {
        if let Some(idle) = idle {
            self.access_deadline = Some(Instant::now() + idle);
        }
    }

    // == Time To Live ==
    /// Remaining time until the nearest deadline, or None if the entry never expires.
    pub fn ttl_remaining(&self) -> Option<Duration> {
        let deadline = match (self.write_deadline, self.access_deadline) {
            (Some(w), Some(a)) => Some(w.min(a)),
            (w, a) => w.or(a),
        };
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}
