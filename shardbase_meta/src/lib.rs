//! Shard topology metadata: the ShardMap store and the topology cache that
//! routers consult on every operation.
use shardbase_shard::{ShardError, ShardMapId};
use thiserror::Error;

pub mod cache;
pub mod store;

pub use cache::{TopologyCache, TopologyConfig, TopologySnapshot};
pub use store::{MemoryTopologyStore, TopologyStore};

/// Result type alias for topology operations.
pub type Result<T> = std::result::Result<T, TopologyError>;

/// Topology store and cache errors.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The backing store could not be reached.
    #[error("topology store unavailable: {0}")]
    Unavailable(String),
    /// No ShardMap with this id.
    #[error("shard map {0} not found")]
    NotFound(ShardMapId),
    /// A ShardMap with this id already exists.
    #[error("shard map {0} already exists")]
    Duplicate(ShardMapId),
    /// The id is reserved for the synthesized fallback shard.
    #[error("shard map id {0} is reserved for the default shard")]
    ReservedId(ShardMapId),
    /// The record itself is malformed.
    #[error(transparent)]
    Invalid(#[from] ShardError),
}
