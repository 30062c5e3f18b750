//! Persistence interface for ShardMap records.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use shardbase_shard::{ShardError, ShardMap, ShardMapId, DEFAULT_SHARD_ID};
use tokio::sync::RwLock;

use crate::{Result, TopologyError};

/// CRUD collection of ShardMaps, usually backed by the master database.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    /// Every ShardMap of every shard set.
    async fn list(&self) -> Result<Vec<ShardMap>>;

    async fn create(&self, map: ShardMap) -> Result<ShardMap>;

    async fn update(&self, map: ShardMap) -> Result<ShardMap>;

    /// Returns `false` when nothing was deleted.
    async fn delete(&self, id: ShardMapId) -> Result<bool>;
}

/// In-memory store, used for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryTopologyStore {
    inner: RwLock<BTreeMap<ShardMapId, ShardMap>>,
    failures: AtomicUsize,
}

impl MemoryTopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_maps(maps: impl IntoIterator<Item = ShardMap>) -> Result<Self> {
        let store = Self::new();
        for map in maps {
            store.create(map).await?;
        }
        Ok(store)
    }

    /// Make the next `n` calls to [`TopologyStore::list`] fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn check(map: &ShardMap) -> Result<()> {
        if map.id == DEFAULT_SHARD_ID {
            return Err(TopologyError::ReservedId(map.id));
        }
        if map.range.is_empty() {
            return Err(ShardError::EmptyRange { start: map.range.start, end: map.range.end }.into());
        }
        Ok(())
    }
}

#[async_trait]
impl TopologyStore for MemoryTopologyStore {
    async fn list(&self) -> Result<Vec<ShardMap>> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(TopologyError::Unavailable("store offline".into()));
        }
        Ok(self.inner.read().await.values().cloned().collect())
    }

    async fn create(&self, map: ShardMap) -> Result<ShardMap> {
        Self::check(&map)?;
        let mut inner = self.inner.write().await;
        if inner.contains_key(&map.id) {
            return Err(TopologyError::Duplicate(map.id));
        }
        inner.insert(map.id, map.clone());
        Ok(map)
    }

    async fn update(&self, map: ShardMap) -> Result<ShardMap> {
        Self::check(&map)?;
        let mut inner = self.inner.write().await;
        match inner.get_mut(&map.id) {
            Some(slot) => {
                *slot = map.clone();
                Ok(map)
            }
            None => Err(TopologyError::NotFound(map.id)),
        }
    }

    async fn delete(&self, id: ShardMapId) -> Result<bool> {
        Ok(self.inner.write().await.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardbase_shard::ShardRange;

    #[tokio::test]
    async fn crud_roundtrip() {
        let store = MemoryTopologyStore::new();
        let map = ShardMap::new(1, "users", ShardRange::full(16), "db://a");
        store.create(map.clone()).await.unwrap();
        assert!(matches!(store.create(map.clone()).await, Err(TopologyError::Duplicate(_))));

        let moved = ShardMap { connection_url: "db://b".into(), ..map };
        store.update(moved).await.unwrap();
        assert_eq!(store.list().await.unwrap()[0].connection_url, "db://b");

        assert!(store.delete(ShardMapId(1)).await.unwrap());
        assert!(!store.delete(ShardMapId(1)).await.unwrap());
        assert!(matches!(
            store.update(ShardMap::new(1, "users", ShardRange::full(16), "db://a")).await,
            Err(TopologyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_reserved_and_empty() {
        let store = MemoryTopologyStore::new();
        let reserved = ShardMap::fallback("users", "db://m", 16);
        assert!(matches!(store.create(reserved).await, Err(TopologyError::ReservedId(_))));
        let empty = ShardMap::new(2, "users", ShardRange { start: 4, end: 4 }, "db://a");
        assert!(matches!(store.create(empty).await, Err(TopologyError::Invalid(_))));
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = MemoryTopologyStore::new();
        store.fail_next(2);
        assert!(store.list().await.is_err());
        assert!(store.list().await.is_err());
        assert!(store.list().await.unwrap().is_empty());
    }
}
