//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror. Only loader failures and
//! configuration errors ever reach callers of the cache API; the remaining
//! variants are produced by collaborators and absorbed by the orchestrator.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error type returned by value loaders.
pub type BoxError = Box<dyn StdError + Send + Sync>;

// == Cache Error Enum ==
/// Unified error type for the cache engine.
///
/// Cloneable so a single loader failure can be handed to every caller that
/// was waiting on the same key.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The caller-supplied loader failed
    #[error("loader failed: {0}")]
    Loader(#[source] Arc<dyn StdError + Send + Sync>),

    /// The loader did not finish within the configured load timeout
    #[error("loader timed out after {0:?}")]
    LoadTimeout(Duration),

    /// Invalid or missing configuration
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Remote tier call failed (timeout, connection error)
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// Distributed lock service failed
    #[error("lock service unavailable: {0}")]
    LockUnavailable(String),

    /// Key or value could not be encoded/decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// Event could not be published or decoded
    #[error("event delivery failed: {0}")]
    EventDelivery(String),
}

impl CacheError {
    /// Wraps a loader error.
    pub fn loader(err: BoxError) -> Self {
        CacheError::Loader(Arc::from(err))
    }

    /// Returns true for errors that surface to cache API callers.
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            CacheError::Loader(_) | CacheError::LoadTimeout(_) | CacheError::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Codec(err.to_string())
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;
