//! Entity router: places records on shards and answers lookups across them.
//!
//! Keys are hashed to a logical shard, resolved to the ShardMaps owning that
//! index, and served by one lazily connected DAO per ShardMap. Writes go to
//! every write shard of the key; reads go to one random replica, or fan out
//! over one shard per distinct range when the lookup field is not the hash
//! field.
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Serialize;
use shardbase_cache::{EntityCache, KvCache};
use shardbase_meta::{TopologyCache, TopologyError, TopologySnapshot};
use shardbase_pool::ShardRegistry;
use shardbase_shard::{owners_of, CoverageReport, IoMode, ShardMap, ShardMapId, ShardSet};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::{
    non_overlapping, DaoError, Entity, FanOutExecutor, Lookup, Result, ShardDao, ShardDaoFactory, ShardQuery,
    ShardTarget, ShardedDaoError, ShardingConfig,
};

const ID_FIELD: &str = "id";

/// ShardMaps of `shard_set` owning `logical_shard` in `mode`.
///
/// `fallback` answers only while the set has no shards at all for `mode`.
/// A configured topology with a gap at `logical_shard` is a routing error.
pub fn route(
    snapshot: &TopologySnapshot,
    shard_set: &str,
    logical_shard: u32,
    mode: IoMode,
    fallback: Option<&ShardMap>,
) -> Result<Vec<ShardMap>> {
    let candidates = match mode {
        IoMode::Read => snapshot.read_shards(shard_set),
        IoMode::Write => snapshot.write_shards(shard_set),
    };
    if candidates.is_empty() {
        return match fallback {
            Some(shard) => Ok(vec![shard.clone()]),
            None if mode == IoMode::Write => Err(ShardedDaoError::NoWritableShards(shard_set.to_string())),
            None => Err(ShardedDaoError::NoShards { shard_set: shard_set.to_string(), logical_shard, mode }),
        };
    }
    let owners: Vec<ShardMap> = owners_of(candidates, logical_shard, mode).into_iter().cloned().collect();
    if owners.is_empty() {
        return Err(ShardedDaoError::NoShards { shard_set: shard_set.to_string(), logical_shard, mode });
    }
    Ok(owners)
}

/// Where a key lands, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct RouteExplain {
    pub shard_set: String,
    pub key: String,
    pub logical_shard: u32,
    pub read: Vec<ShardMap>,
    pub write: Vec<ShardMap>,
}

impl RouteExplain {
    /// Unroutable modes come back empty.
    pub fn build(snapshot: &TopologySnapshot, shard_set: &ShardSet, key: &str, fallback: Option<&ShardMap>) -> Self {
        let logical_shard = shard_set.logical_shard(key);
        let owners = |mode| route(snapshot, &shard_set.name, logical_shard, mode, fallback).unwrap_or_default();
        Self {
            shard_set: shard_set.name.clone(),
            key: key.to_string(),
            logical_shard,
            read: owners(IoMode::Read),
            write: owners(IoMode::Write),
        }
    }

    pub fn routable(&self) -> bool {
        !self.read.is_empty() && !self.write.is_empty()
    }
}

/// Sharded DAO for one entity type.
pub struct ShardedDao<E: Entity> {
    pub(crate) config: ShardingConfig,
    pub(crate) shard_set: ShardSet,
    pub(crate) topology: Arc<TopologyCache>,
    pub(crate) registry: Arc<ShardRegistry<dyn ShardDao<E>>>,
    pub(crate) factory: Arc<dyn ShardDaoFactory<E>>,
    pub(crate) cache: EntityCache,
    pub(crate) fanout: FanOutExecutor,
    pub(crate) fallback: Option<ShardMap>,
}

impl<E: Entity> ShardedDao<E> {
    /// Build a router over `topology`.
    ///
    /// `registry` may be shared with other routers of the same entity type
    /// so that a physical database gets one DAO per process.
    pub fn new(
        config: ShardingConfig,
        topology: Arc<TopologyCache>,
        registry: Arc<ShardRegistry<dyn ShardDao<E>>>,
        factory: Arc<dyn ShardDaoFactory<E>>,
        kv: Arc<dyn KvCache>,
    ) -> Result<Self> {
        config.validate()?;
        let shard_set =
            ShardSet::new(config.shard_set.clone(), config.logical_shard_count).map_err(TopologyError::from)?;
        topology.register_shard_set(&shard_set);
        let fallback = config
            .master_url
            .as_ref()
            .map(|url| ShardMap::fallback(&shard_set.name, url, shard_set.logical_shard_count));
        let cache = EntityCache::new(kv, config.namespace(), config.cache_ttl());
        let fanout = FanOutExecutor::new(config.fanout_pool_size, config.fanout_timeout());
        Ok(Self { config, shard_set, topology, registry, factory, cache, fanout, fallback })
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn shard_set(&self) -> &ShardSet {
        &self.shard_set
    }

    pub fn topology(&self) -> &Arc<TopologyCache> {
        &self.topology
    }

    pub fn registry(&self) -> &Arc<ShardRegistry<dyn ShardDao<E>>> {
        &self.registry
    }

    /// The synthesized master shard, when a master URL is configured.
    pub fn fallback(&self) -> Option<&ShardMap> {
        self.fallback.as_ref()
    }

    pub fn logical_shard(&self, key: &str) -> u32 {
        self.shard_set.logical_shard(key)
    }

    fn routing_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(ShardedDaoError::MissingHashKey { field: E::hash_field() });
        }
        Ok(())
    }

    fn hash_key(entity: &E) -> Result<String> {
        entity.hash_key().ok_or(ShardedDaoError::MissingHashKey { field: E::hash_field() })
    }

    pub(crate) async fn connect(&self, shard: ShardMap) -> Result<ShardTarget<E>> {
        let factory = self.factory.clone();
        let dao = self
            .registry
            .get_or_connect(&shard, move |map| async move { factory.open(&map).await })
            .await?;
        Ok(ShardTarget { shard, dao })
    }

    /// Every shard owning `key` in `mode`, connected.
    #[instrument(skip(self), fields(shard_set = %self.shard_set.name))]
    pub async fn get_daos(&self, key: &str, mode: IoMode) -> Result<Vec<ShardTarget<E>>> {
        self.routing_key(key)?;
        let logical_shard = self.logical_shard(key);
        let snapshot = self.topology.current().await;
        let shards = route(&snapshot, &self.shard_set.name, logical_shard, mode, self.fallback.as_ref())?;
        debug!(logical_shard, shards = shards.len(), "routed key");
        let mut targets = Vec::with_capacity(shards.len());
        for shard in shards {
            targets.push(self.connect(shard).await?);
        }
        Ok(targets)
    }

    /// One random shard owning `key` in `mode`.
    pub async fn get_dao(&self, key: &str, mode: IoMode) -> Result<ShardTarget<E>> {
        self.routing_key(key)?;
        let logical_shard = self.logical_shard(key);
        let snapshot = self.topology.current().await;
        let shards = route(&snapshot, &self.shard_set.name, logical_shard, mode, self.fallback.as_ref())?;
        let shard = shards.choose(&mut rand::thread_rng()).cloned().ok_or_else(|| ShardedDaoError::NoShards {
            shard_set: self.shard_set.name.clone(),
            logical_shard,
            mode,
        })?;
        self.connect(shard).await
    }

    /// One connected shard per distinct read range.
    ///
    /// Shards that fail to connect are left out. Having nothing to ask is an
    /// error, so a lookup never reports "not found" without asking a shard.
    async fn fan_out_targets(&self) -> Result<Vec<ShardTarget<E>>> {
        let mut shards = self.topology.find_read_shards(&self.shard_set.name).await;
        if shards.is_empty() {
            match &self.fallback {
                Some(shard) => shards.push(shard.clone()),
                None => return Err(ShardedDaoError::NoReadableShards(self.shard_set.name.clone())),
            }
        }
        let mut targets = Vec::new();
        let mut first_error = None;
        for shard in non_overlapping(&shards) {
            let id = shard.id;
            match self.connect(shard).await {
                Ok(target) => targets.push(target),
                Err(e) => {
                    warn!(shard = %id, error = %e, "cannot connect shard, leaving it out of fan-out");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) if targets.is_empty() => Err(e),
            _ => Ok(targets),
        }
    }

    async fn all_write_targets(&self) -> Result<Vec<ShardTarget<E>>> {
        let mut shards = self.topology.find_write_shards(&self.shard_set.name).await;
        if shards.is_empty() {
            match &self.fallback {
                Some(shard) => shards.push(shard.clone()),
                None => return Err(ShardedDaoError::NoWritableShards(self.shard_set.name.clone())),
            }
        }
        let mut targets = Vec::with_capacity(shards.len());
        for shard in shards {
            targets.push(self.connect(shard).await?);
        }
        Ok(targets)
    }

    /// Insert `entity` on every write shard of its hash key.
    #[instrument(skip(self, entity), fields(shard_set = %self.shard_set.name, id = %entity.id()))]
    pub async fn create(&self, entity: &E) -> Result<E> {
        let key = Self::hash_key(entity)?;
        let targets = self.get_daos(&key, IoMode::Write).await?;
        let written = self
            .replicate(entity.id(), targets, |dao| {
                let entity = entity.clone();
                async move { dao.create(&entity).await }
            })
            .await?;
        written.into_iter().next().ok_or_else(|| ShardedDaoError::NoWritableShards(self.shard_set.name.clone()))
    }

    /// Overwrite `entity` on every write shard of its hash key.
    #[instrument(skip(self, entity), fields(shard_set = %self.shard_set.name, id = %entity.id()))]
    pub async fn update(&self, entity: &E) -> Result<E> {
        let key = Self::hash_key(entity)?;
        let targets = self.get_daos(&key, IoMode::Write).await?;
        let written = self
            .replicate(entity.id(), targets, |dao| {
                let entity = entity.clone();
                async move { dao.update(&entity).await }
            })
            .await?;
        written.into_iter().next().ok_or_else(|| ShardedDaoError::NoWritableShards(self.shard_set.name.clone()))
    }

    /// Delete `id` everywhere it may live. Unless records are hashed by id,
    /// that is every write shard of the set.
    #[instrument(skip(self), fields(shard_set = %self.shard_set.name))]
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let targets = if E::hash_field() == ID_FIELD {
            self.get_daos(id, IoMode::Write).await?
        } else {
            self.all_write_targets().await?
        };
        let deleted = self
            .replicate(id, targets, |dao| {
                let id = id.to_string();
                async move { dao.delete(&id).await }
            })
            .await?;
        Ok(deleted.into_iter().any(|d| d))
    }

    /// Run `op` on every target concurrently.
    ///
    /// Returns the results in completion order; the first is canonical. The
    /// cache entries derived from `uuid` are dropped as soon as one shard
    /// succeeds. Nothing is rolled back when some shards fail. The writes and
    /// the invalidation run on a detached task, so they finish even if the
    /// caller stops waiting.
    async fn replicate<T, F, Fut>(&self, uuid: &str, targets: Vec<ShardTarget<E>>, op: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn ShardDao<E>>) -> Fut,
        Fut: Future<Output = std::result::Result<T, DaoError>> + Send + 'static,
    {
        let writes: Vec<(ShardMapId, Fut)> = targets.into_iter().map(|t| (t.shard.id, op(t.dao))).collect();
        let driver = tokio::spawn(drive_writes(self.cache.clone(), uuid.to_string(), writes));
        let Replicated { written, succeeded, failed } =
            driver.await.map_err(|e| DaoError::Backend(format!("write driver failed: {e}")))?;

        if failed.is_empty() {
            return Ok(written);
        }
        if succeeded.is_empty() {
            return match failed.into_iter().next() {
                Some((_, first)) => Err(first.into()),
                None => Err(ShardedDaoError::NoWritableShards(self.shard_set.name.clone())),
            };
        }
        warn!(succeeded = succeeded.len(), failed = failed.len(), "replicated write is partial");
        Err(ShardedDaoError::PartialWrite { succeeded, failed })
    }

    /// Drop every cached lookup derived from `uuid`.
    pub async fn invalidate(&self, uuid: &str) -> Result<()> {
        Ok(self.cache.invalidate(uuid).await?)
    }

    #[instrument(skip(self), fields(shard_set = %self.shard_set.name))]
    pub async fn get(&self, id: &str) -> Result<Option<E>> {
        let direct = (E::hash_field() == ID_FIELD).then_some(id);
        self.cached_unique(ShardQuery::get(id), direct).await
    }

    #[instrument(skip(self), fields(shard_set = %self.shard_set.name))]
    pub async fn find_by_unique_field(&self, field: &str, value: &str) -> Result<Option<E>> {
        let direct = (field == E::hash_field()).then_some(value);
        self.cached_unique(ShardQuery::by_unique_field(field, value), direct).await
    }

    /// Up to `max_results` rows whose `field` equals `value`.
    pub async fn find_by_field(&self, field: &str, value: &str, max_results: usize) -> Result<Vec<E>> {
        let direct = (field == E::hash_field()).then_some(value);
        self.list(ShardQuery::by_field(field, value), direct, max_results).await
    }

    /// Up to `max_results` rows whose `field` equals any of `values`.
    pub async fn find_by_field_in(&self, field: &str, values: &[String], max_results: usize) -> Result<Vec<E>> {
        if field != E::hash_field() {
            return self.list(ShardQuery::by_field_in(field, values.to_vec()), None, max_results).await;
        }
        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        for value in values {
            if rows.len() >= max_results {
                break;
            }
            let found = self.list(ShardQuery::by_field(field, value.clone()), Some(value.as_str()), max_results).await?;
            for row in found {
                if rows.len() < max_results && seen.insert(row.id().to_string()) {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    /// Up to `max_results` rows from across the set.
    pub async fn find_all(&self, max_results: usize) -> Result<Vec<E>> {
        self.list(ShardQuery::All, None, max_results).await
    }

    async fn cached_unique(&self, query: ShardQuery, direct: Option<&str>) -> Result<Option<E>> {
        match query.cache_key() {
            Some(key) => self.cache.lookup_if(&key, || self.unique(query, direct)).await,
            None => Ok(self.unique(query, direct).await?.0),
        }
    }

    /// The answer, and whether it is complete enough to cache. A miss is only
    /// complete when every shard asked answered.
    ///
    /// `direct` is the hash key when the query can be routed by it.
    async fn unique(&self, query: ShardQuery, direct: Option<&str>) -> Result<(Option<E>, bool)> {
        match direct {
            Some(key) => {
                let target = self.get_dao(key, IoMode::Read).await?;
                Ok((query.unique(&*target.dao).await?, true))
            }
            None => {
                let targets = self.fan_out_targets().await?;
                Ok(match self.fanout.query_unique(targets, query).await? {
                    Lookup::Found(entity) => (Some(entity), true),
                    Lookup::Absent => (None, true),
                    Lookup::Unknown => (None, false),
                })
            }
        }
    }

    async fn list(&self, query: ShardQuery, direct: Option<&str>, max_results: usize) -> Result<Vec<E>> {
        match direct {
            Some(key) => {
                let target = self.get_dao(key, IoMode::Read).await?;
                Ok(query.list(&*target.dao, max_results).await?)
            }
            None => self.fanout.query_list(self.fan_out_targets().await?, query, max_results).await,
        }
    }

    pub async fn route_explain(&self, key: &str) -> Result<RouteExplain> {
        self.routing_key(key)?;
        let snapshot = self.topology.current().await;
        Ok(RouteExplain::build(&snapshot, &self.shard_set, key, self.fallback.as_ref()))
    }

    /// Coverage of this router's shard set.
    pub async fn validate(&self) -> CoverageReport {
        self.topology.validate(&self.shard_set.name).await
    }
}

struct Replicated<T> {
    written: Vec<T>,
    succeeded: Vec<ShardMapId>,
    failed: Vec<(ShardMapId, DaoError)>,
}

/// Run one write per shard and drop the cached lookups of `uuid` once any
/// shard has taken the write.
async fn drive_writes<T, Fut>(cache: EntityCache, uuid: String, writes: Vec<(ShardMapId, Fut)>) -> Replicated<T>
where
    T: Send + 'static,
    Fut: Future<Output = std::result::Result<T, DaoError>> + Send + 'static,
{
    let ids: Vec<ShardMapId> = writes.iter().map(|(id, _)| *id).collect();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for (id, write) in writes {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send((id, write.await));
        });
    }
    drop(tx);

    let mut written = Vec::with_capacity(ids.len());
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    while let Some((id, result)) = rx.recv().await {
        match result {
            Ok(value) => {
                if written.is_empty() {
                    invalidate_quietly(&cache, &uuid).await;
                }
                succeeded.push(id);
                written.push(value);
            }
            Err(e) => {
                warn!(shard = %id, error = %e, "shard write failed");
                failed.push((id, e));
            }
        }
    }
    for id in ids {
        if !succeeded.contains(&id) && !failed.iter().any(|(f, _)| *f == id) {
            failed.push((id, DaoError::Backend("write task aborted".into())));
        }
    }
    if succeeded.len() > 1 {
        // Reads served by slower replicas in between may have re-cached.
        invalidate_quietly(&cache, &uuid).await;
    }
    Replicated { written, succeeded, failed }
}

async fn invalidate_quietly(cache: &EntityCache, uuid: &str) {
    if let Err(e) = cache.invalidate(uuid).await {
        warn!(uuid, error = %e, "cache invalidation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{config, doc, harness, harness_with, key_where, shard, Doc, COUNT, MASTER};
    use shardbase_cache::MemoryKvCache;
    use shardbase_meta::{MemoryTopologyStore, TopologyConfig};
    use std::time::Duration;

    struct RefusingFactory;

    #[async_trait::async_trait]
    impl ShardDaoFactory<Doc> for RefusingFactory {
        async fn open(&self, shard: &ShardMap) -> std::result::Result<Arc<dyn ShardDao<Doc>>, DaoError> {
            Err(DaoError::Unavailable { url: shard.connection_url.clone(), reason: "connection refused".into() })
        }
    }

    #[tokio::test]
    async fn routes_by_owning_range() {
        let h = harness(vec![shard(1, 0, 100), shard(2, 100, COUNT)]).await;
        let key = key_where(|i| i == 50);
        assert_eq!(h.dao.logical_shard(&key), 50);
        for _ in 0..5 {
            let targets = h.dao.get_daos(&key, IoMode::Read).await.unwrap();
            assert_eq!(targets.len(), 1);
            assert_eq!(targets[0].shard.id, ShardMapId(1));
            assert_eq!(h.dao.get_dao(&key, IoMode::Write).await.unwrap().shard.id, ShardMapId(1));
        }
        let high = key_where(|i| i >= 100);
        assert_eq!(h.dao.get_dao(&high, IoMode::Read).await.unwrap().shard.id, ShardMapId(2));
        assert_eq!(h.factory.opened(), 2);
    }

    #[tokio::test]
    async fn fan_out_list_covers_every_range() {
        let ranges = [(1, 0, 64), (2, 64, 128), (3, 128, 192), (4, 192, COUNT)];
        let h = harness(ranges.iter().map(|&(id, s, e)| shard(id, s, e)).collect()).await;
        for &(id, start, end) in &ranges {
            let account = key_where(|i| i >= start && i < end);
            h.dao.create(&doc(&format!("d{id}"), &account, "same@x")).await.unwrap();
            assert!(h.factory.database(&format!("mem://shard-{id}")).contains(&format!("d{id}")).await);
        }
        let rows = h.dao.find_by_field("email", "same@x", 10).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(h.dao.find_all(3).await.unwrap().len(), 3);
        let values = vec!["same@x".to_string(), "other@x".to_string()];
        assert_eq!(h.dao.find_by_field_in("email", &values, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn hash_field_lookups_stay_on_one_shard() {
        let h = harness(vec![shard(1, 0, 128), shard(2, 128, COUNT)]).await;
        let account = key_where(|i| i < 128);
        h.dao.create(&doc("d1", &account, "a@x")).await.unwrap();
        h.dao.create(&doc("d2", &account, "b@x")).await.unwrap();
        let other = h.factory.database("mem://shard-2");
        let before = other.queries();
        assert_eq!(h.dao.find_by_field("account", &account, 10).await.unwrap().len(), 2);
        assert_eq!(h.dao.find_by_field_in("account", &[account.clone()], 1).await.unwrap().len(), 1);
        assert!(h.dao.find_by_unique_field("account", &account).await.unwrap().is_some());
        assert_eq!(other.queries(), before);
    }

    #[tokio::test]
    async fn delete_invalidates_cached_lookups() {
        let h = harness(vec![shard(1, 0, COUNT)]).await;
        let db = h.factory.database("mem://shard-1");
        h.dao.create(&doc("d1", "acct-1", "a@x")).await.unwrap();

        assert_eq!(h.dao.find_by_unique_field("email", "a@x").await.unwrap().unwrap().id, "d1");
        let after_first = db.queries();
        assert!(!h.kv.is_empty().await);
        assert!(h.dao.find_by_unique_field("email", "a@x").await.unwrap().is_some());
        assert_eq!(db.queries(), after_first, "second lookup should be cached");

        assert!(h.dao.delete("d1").await.unwrap());
        let after_delete = db.queries();
        assert!(h.dao.find_by_unique_field("email", "a@x").await.unwrap().is_none());
        assert!(db.queries() > after_delete, "lookup after delete must hit storage");
    }

    #[tokio::test]
    async fn update_invalidates_identity_lookup() {
        let h = harness(vec![shard(1, 0, COUNT)]).await;
        let mut record = doc("d1", "acct-1", "a@x");
        h.dao.create(&record).await.unwrap();
        assert_eq!(h.dao.get("d1").await.unwrap().unwrap().title, "");
        record.title = "renamed".into();
        h.dao.update(&record).await.unwrap();
        assert_eq!(h.dao.get("d1").await.unwrap().unwrap().title, "renamed");
    }

    #[tokio::test]
    async fn cached_miss_is_dropped_by_a_create() {
        let h = harness(vec![shard(1, 0, COUNT)]).await;
        assert!(h.dao.find_by_unique_field("email", "new@x").await.unwrap().is_none());
        h.dao.create(&doc("d9", "acct-9", "new@x")).await.unwrap();
        assert_eq!(h.dao.find_by_unique_field("email", "new@x").await.unwrap().unwrap().id, "d9");
    }

    #[tokio::test]
    async fn empty_topology_uses_master() {
        let h = harness(vec![]).await;
        let master = h.factory.database(MASTER);
        let created = h.dao.create(&doc("d1", "acct-1", "a@x")).await.unwrap();
        assert_eq!(created.id, "d1");
        assert!(master.contains("d1").await);
        assert_eq!(h.dao.get("d1").await.unwrap().unwrap().email, "a@x");
        assert_eq!(h.dao.find_by_unique_field("email", "a@x").await.unwrap().unwrap().id, "d1");
        assert_eq!(h.dao.find_all(10).await.unwrap().len(), 1);
        let target = h.dao.get_dao("acct-1", IoMode::Write).await.unwrap();
        assert!(target.shard.default_shard);
        assert!(h.dao.delete("d1").await.unwrap());
        assert!(master.is_empty().await);
    }

    #[tokio::test]
    async fn no_master_and_no_shards_cannot_write() {
        let h = harness_with(vec![], ShardingConfig { master_url: None, ..config() }).await;
        let err = h.dao.create(&doc("d1", "acct-1", "a@x")).await.unwrap_err();
        assert!(matches!(err, ShardedDaoError::NoWritableShards(_)));
        assert!(err.is_routing());
    }

    #[tokio::test]
    async fn no_master_and_no_shards_cannot_read() {
        let h = harness_with(vec![], ShardingConfig { master_url: None, ..config() }).await;
        let err = h.dao.find_by_unique_field("email", "a@x").await.unwrap_err();
        assert!(matches!(err, ShardedDaoError::NoReadableShards(_)));
        assert!(err.is_routing());
        assert!(h.dao.get("d1").await.unwrap_err().is_routing());
        assert!(h.dao.find_all(10).await.unwrap_err().is_routing());
        assert!(h.kv.is_empty().await);
    }

    #[tokio::test]
    async fn unreachable_shards_fail_lookups() {
        let store = Arc::new(MemoryTopologyStore::with_maps(vec![shard(1, 0, 128), shard(2, 128, COUNT)]).await.unwrap());
        let topology = Arc::new(TopologyCache::new(
            store,
            TopologyConfig { refresh_interval: Duration::from_secs(3_600), logical_shard_count: COUNT },
        ));
        let kv = Arc::new(MemoryKvCache::new());
        let dao = ShardedDao::new(config(), topology, Arc::new(ShardRegistry::new()), Arc::new(RefusingFactory), kv.clone())
            .unwrap();

        let err = dao.find_by_unique_field("email", "a@x").await.unwrap_err();
        assert!(matches!(err, ShardedDaoError::Shard(DaoError::Unavailable { .. })));
        assert!(dao.find_by_field("email", "a@x", 10).await.is_err());
        assert!(dao.find_all(10).await.is_err());
        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn miss_with_an_unanswered_shard_is_not_cached() {
        let h = harness(vec![shard(1, 0, 128), shard(2, 128, COUNT)]).await;
        let account = key_where(|i| i >= 128);
        h.dao.create(&doc("d1", &account, "late@x")).await.unwrap();
        let holder = h.factory.database("mem://shard-2");

        holder.set_offline(true);
        assert!(h.dao.find_by_unique_field("email", "late@x").await.unwrap().is_none());
        holder.set_offline(false);
        assert_eq!(h.dao.find_by_unique_field("email", "late@x").await.unwrap().unwrap().id, "d1");

        assert!(h.dao.find_by_unique_field("email", "nobody@x").await.unwrap().is_none());
        let before = holder.queries();
        assert!(h.dao.find_by_unique_field("email", "nobody@x").await.unwrap().is_none());
        assert_eq!(holder.queries(), before, "complete miss should be cached");
    }

    #[tokio::test]
    async fn abandoned_create_still_invalidates() {
        let h = harness(vec![shard(1, 0, COUNT)]).await;
        assert!(h.dao.find_by_unique_field("email", "late@x").await.unwrap().is_none());

        let record = doc("d1", "acct-1", "late@x");
        tokio::select! {
            biased;
            _ = h.dao.create(&record) => {}
            _ = std::future::ready(()) => {}
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.factory.database("mem://shard-1").contains("d1").await);
        assert_eq!(h.dao.find_by_unique_field("email", "late@x").await.unwrap().unwrap().id, "d1");
    }

    #[tokio::test]
    async fn empty_hash_key_is_a_routing_error() {
        let h = harness(vec![shard(1, 0, COUNT)]).await;
        let err = h.dao.create(&doc("d1", "", "a@x")).await.unwrap_err();
        assert!(matches!(err, ShardedDaoError::MissingHashKey { field: "account" }));
        assert!(h.dao.get_daos("", IoMode::Read).await.unwrap_err().is_routing());
        assert!(h.factory.database("mem://shard-1").is_empty().await);
    }

    #[tokio::test]
    async fn coverage_gap_is_a_routing_error() {
        let h = harness(vec![shard(1, 0, 100)]).await;
        let uncovered = key_where(|i| i >= 100);
        let err = h.dao.create(&doc("d1", &uncovered, "a@x")).await.unwrap_err();
        assert!(matches!(err, ShardedDaoError::NoShards { mode: IoMode::Write, .. }));
        assert!(!h.dao.validate().await.valid);
    }

    #[tokio::test]
    async fn replicas_all_receive_writes() {
        let h = harness(vec![shard(1, 0, COUNT), shard(2, 0, COUNT)]).await;
        h.dao.create(&doc("d1", "acct-1", "a@x")).await.unwrap();
        assert!(h.factory.database("mem://shard-1").contains("d1").await);
        assert!(h.factory.database("mem://shard-2").contains("d1").await);
        assert_eq!(h.dao.find_by_field("email", "a@x", 10).await.unwrap().len(), 1);
        assert!(h.dao.delete("d1").await.unwrap());
        assert!(h.factory.database("mem://shard-2").is_empty().await);
    }

    #[tokio::test]
    async fn partial_replication_is_surfaced() {
        let h = harness(vec![shard(1, 0, COUNT), shard(2, 0, COUNT)]).await;
        h.factory.database("mem://shard-2").set_offline(true);
        let err = h.dao.create(&doc("d1", "acct-1", "a@x")).await.unwrap_err();
        match err {
            ShardedDaoError::PartialWrite { succeeded, failed } => {
                assert_eq!(succeeded, vec![ShardMapId(1)]);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, ShardMapId(2));
                assert!(matches!(failed[0].1, DaoError::Unavailable { .. }));
            }
            other => panic!("expected partial write, got {other:?}"),
        }
        assert!(h.factory.database("mem://shard-1").contains("d1").await);

        h.factory.database("mem://shard-1").set_offline(true);
        let err = h.dao.create(&doc("d2", "acct-1", "b@x")).await.unwrap_err();
        assert!(matches!(err, ShardedDaoError::Shard(DaoError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn explain_lists_owners() {
        let h = harness(vec![shard(1, 0, 100), shard(2, 0, 100).with_access(true, false), shard(3, 100, COUNT)]).await;
        let key = key_where(|i| i < 100);
        let explain = h.dao.route_explain(&key).await.unwrap();
        assert!(explain.logical_shard < 100);
        assert_eq!(explain.read.len(), 2);
        assert_eq!(explain.write.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ShardMapId(1)]);
        assert!(explain.routable());
        assert!(h.dao.route_explain("").await.is_err());
    }
}
