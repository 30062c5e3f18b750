//! Sharded data-access layer.
//!
//! [`ShardedDao`] spreads one entity type over the physical databases of a
//! shard set. The partition key of a record is hashed to a fixed logical
//! shard index; the topology decides which databases own that index. Lookups
//! that cannot use the partition key fan out over one database per distinct
//! range, and every write invalidates the cached lookups derived from the
//! record.
pub mod config;
pub mod dao;
pub mod error;
pub mod fanout;
pub mod housekeeping;
pub mod memory;
pub mod query;
pub mod router;

#[cfg(test)]
pub(crate) mod fixtures;

pub use config::{ConfigError, ShardingConfig};
pub use dao::{Entity, ShardDao, ShardDaoFactory, ShardTarget};
pub use error::{DaoError, Result, ShardedDaoError};
pub use fanout::{non_overlapping, FanOutExecutor, Lookup};
pub use memory::{MemoryDatabase, MemoryShardDao, MemoryShardDaoFactory};
pub use query::ShardQuery;
pub use router::{route, RouteExplain, ShardedDao};
