use std::time::Duration;

use shardbase_cache::CacheError;
use shardbase_meta::TopologyError;
use shardbase_shard::{IoMode, ShardMapId};
use thiserror::Error;

use crate::ConfigError;

/// Result type alias for sharded operations.
pub type Result<T> = std::result::Result<T, ShardedDaoError>;

/// Failure reported by a single-shard DAO.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DaoError {
    #[error("record {0} not found")]
    NotFound(String),
    #[error("record {0} already exists")]
    Duplicate(String),
    #[error("shard {url} unavailable: {reason}")]
    Unavailable { url: String, reason: String },
    #[error("shard backend error: {0}")]
    Backend(String),
}

/// Errors surfaced to callers of a sharded DAO.
///
/// Routing, timeout and partial-write failures are distinct variants so a
/// caller can tell "no data" from "could not tell where to look" from "took
/// too long".
#[derive(Debug, Error)]
pub enum ShardedDaoError {
    /// The hash field is unset, so the record cannot be placed.
    #[error("cannot route: hash field `{field}` is empty")]
    MissingHashKey { field: &'static str },
    /// The topology has shards for this set but none owns the index.
    #[error("no {mode:?} shard of `{shard_set}` owns logical shard {logical_shard}")]
    NoShards { shard_set: String, logical_shard: u32, mode: IoMode },
    /// Nothing to write to, even after falling back to the default shard.
    #[error("no writable shard for `{0}`")]
    NoWritableShards(String),
    /// Nothing to fan a lookup out to, even after falling back to the default shard.
    #[error("no readable shard for `{0}`")]
    NoReadableShards(String),
    /// A fan-out lookup got no answer from any shard in time.
    #[error("fan-out over {shards} shards timed out after {elapsed:?}")]
    Timeout { shards: usize, elapsed: Duration },
    /// Some replicas took the write, others did not. Nothing is rolled back.
    #[error("write reached {} of {} shards", .succeeded.len(), .succeeded.len() + .failed.len())]
    PartialWrite { succeeded: Vec<ShardMapId>, failed: Vec<(ShardMapId, DaoError)> },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Shard(#[from] DaoError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ShardedDaoError {
    /// Routing failures are not worth retrying.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            Self::MissingHashKey { .. }
                | Self::NoShards { .. }
                | Self::NoWritableShards(_)
                | Self::NoReadableShards(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
