//! Front-line key/value cache for sharded lookups.
//!
//! [`KvCache`] is the cache service contract; [`MemoryKvCache`] implements it
//! in-process. [`EntityCache`] layers per-entity-type namespacing and
//! reverse-index invalidation on top.
use thiserror::Error;

pub mod entity;
pub mod kv;

pub use entity::EntityCache;
pub use kv::{KvCache, MemoryKvCache};

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache service failed or is unreachable.
    #[error("cache backend error: {0}")]
    Backend(String),
    /// A key holds a scalar where a list was expected, or the reverse.
    #[error("wrong value type at key {0}")]
    WrongType(String),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}
