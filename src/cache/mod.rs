//! Cache Module
//!
//! The two-tier cache: a bounded local store with TTL expiration and LRU
//! eviction, backed by an optional remote tier, with per-key stampede
//! protection and cross-instance invalidation.

mod builder;
mod entry;
mod guard;
mod lru;
mod multi_tier;
mod stats;
mod store;


// Re-export public types
pub use builder::CacheBuilder;
pub use entry::{CacheEntry, CacheValue};
pub use guard::{LoadOutcome, LockPolicy, StampedeGuard, TierLookup};
pub use lru::LruTracker;
pub use multi_tier::{LoadFuture, Loader, MultiTierCache};
pub use stats::{CacheStats, StatsCounter};
pub use store::LocalStore;
