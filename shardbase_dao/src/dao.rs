//! Contracts for the single-shard DAOs the router composes.
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardbase_shard::{ShardMap, Shardable};

use crate::DaoError;

/// Everything a record type needs to be routed, cached and moved across tasks.
pub trait Entity: Shardable + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Entity for T where T: Shardable + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// CRUD and simple lookups against one physical database.
#[async_trait]
pub trait ShardDao<E: Send + Sync>: Send + Sync {
    async fn create(&self, entity: &E) -> Result<E, DaoError>;

    async fn update(&self, entity: &E) -> Result<E, DaoError>;

    /// Returns `false` when the record did not exist.
    async fn delete(&self, id: &str) -> Result<bool, DaoError>;

    async fn get(&self, id: &str) -> Result<Option<E>, DaoError>;

    async fn find_by_unique_field(&self, field: &str, value: &str) -> Result<Option<E>, DaoError>;

    async fn find_by_field(&self, field: &str, value: &str, limit: usize) -> Result<Vec<E>, DaoError>;

    async fn find_all(&self, limit: usize) -> Result<Vec<E>, DaoError>;

    /// Release the underlying connection.
    async fn close(&self) {}
}

/// Builds a connected [`ShardDao`] for a ShardMap.
#[async_trait]
pub trait ShardDaoFactory<E: Send + Sync>: Send + Sync {
    async fn open(&self, shard: &ShardMap) -> Result<Arc<dyn ShardDao<E>>, DaoError>;
}

/// A resolved shard and its DAO.
pub struct ShardTarget<E: Send + Sync> {
    pub shard: ShardMap,
    pub dao: Arc<dyn ShardDao<E>>,
}

impl<E: Send + Sync> Clone for ShardTarget<E> {
    fn clone(&self) -> Self {
        Self { shard: self.shard.clone(), dao: self.dao.clone() }
    }
}

impl<E: Send + Sync> std::fmt::Debug for ShardTarget<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardTarget").field("shard", &self.shard.id).finish()
    }
}
