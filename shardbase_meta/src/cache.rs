//! Background-refreshed topology cache.
//!
//! Snapshots are immutable once published. A refresh is single-flight:
//! callers arriving while a load is in progress get the previous snapshot
//! instead of waiting or issuing a second load.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use shardbase_shard::{
    CoverageReport, ShardMap, ShardMapId, ShardSet, DEFAULT_LOGICAL_SHARD_COUNT,
};
use tracing::{debug, info, warn};

use crate::{Result, TopologyStore};

/// Topology cache settings.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Snapshots older than this are reloaded on next access.
    pub refresh_interval: Duration,
    /// Count assumed for shard sets that were never registered.
    pub logical_shard_count: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60 * 60),
            logical_shard_count: DEFAULT_LOGICAL_SHARD_COUNT,
        }
    }
}

/// One immutable view of the full topology.
#[derive(Debug, Default)]
pub struct TopologySnapshot {
    all: Vec<ShardMap>,
    read: HashMap<String, Vec<ShardMap>>,
    write: HashMap<String, Vec<ShardMap>>,
    loaded_at: Option<Instant>,
}

impl TopologySnapshot {
    fn build(all: Vec<ShardMap>) -> Self {
        let mut read: HashMap<String, Vec<ShardMap>> = HashMap::new();
        let mut write: HashMap<String, Vec<ShardMap>> = HashMap::new();
        for map in &all {
            if map.allow_read {
                read.entry(map.shard_set.clone()).or_default().push(map.clone());
            }
            if map.allow_write {
                write.entry(map.shard_set.clone()).or_default().push(map.clone());
            }
        }
        Self { all, read, write, loaded_at: Some(Instant::now()) }
    }

    pub fn all(&self) -> &[ShardMap] {
        &self.all
    }

    pub fn read_shards(&self, shard_set: &str) -> &[ShardMap] {
        self.read.get(shard_set).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn write_shards(&self, shard_set: &str) -> &[ShardMap] {
        self.write.get(shard_set).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn shards(&self, shard_set: &str) -> Vec<ShardMap> {
        self.all.iter().filter(|m| m.shard_set == shard_set).cloned().collect()
    }

    pub fn contains(&self, id: ShardMapId) -> bool {
        self.all.iter().any(|m| m.id == id)
    }

    pub fn shard_sets(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.all.iter().map(|m| m.shard_set.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Never-loaded snapshots are always stale.
    pub fn is_stale(&self, interval: Duration) -> bool {
        self.loaded_at.map_or(true, |at| at.elapsed() >= interval)
    }
}

/// Resets the single-flight flag even if the refreshing future is dropped.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cached, validated view over a [`TopologyStore`].
pub struct TopologyCache {
    store: Arc<dyn TopologyStore>,
    config: TopologyConfig,
    counts: RwLock<HashMap<String, u32>>,
    current: RwLock<Arc<TopologySnapshot>>,
    refreshing: AtomicBool,
    dirty: AtomicBool,
}

impl TopologyCache {
    pub fn new(store: Arc<dyn TopologyStore>, config: TopologyConfig) -> Self {
        Self {
            store,
            config,
            counts: RwLock::new(HashMap::new()),
            current: RwLock::new(Arc::new(TopologySnapshot::default())),
            refreshing: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn TopologyStore> {
        &self.store
    }

    /// Record the logical shard count coverage is checked against for `set`.
    pub fn register_shard_set(&self, set: &ShardSet) {
        self.counts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(set.name.clone(), set.logical_shard_count);
    }

    pub fn logical_shard_count(&self, shard_set: &str) -> u32 {
        self.counts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(shard_set)
            .copied()
            .unwrap_or(self.config.logical_shard_count)
    }

    /// Last published snapshot, without triggering a refresh.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Snapshot refreshed if stale. Store failures are logged and the
    /// previous snapshot is served.
    pub async fn current(&self) -> Arc<TopologySnapshot> {
        match self.refresh(false).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "topology refresh failed, serving previous snapshot");
                self.snapshot()
            }
        }
    }

    /// Reload from the store when stale or when `force` is set.
    pub async fn refresh(&self, force: bool) -> Result<Arc<TopologySnapshot>> {
        let previous = self.snapshot();
        if !force && !previous.is_stale(self.config.refresh_interval) {
            return Ok(previous);
        }
        if force {
            self.dirty.store(true, Ordering::SeqCst);
        }
        loop {
            if self
                .refreshing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("topology refresh in flight, serving previous snapshot");
                return Ok(self.snapshot());
            }
            let guard = RefreshGuard(&self.refreshing);
            self.dirty.store(false, Ordering::SeqCst);
            let loaded = self.load().await;
            drop(guard);
            let snapshot = loaded?;
            // A forced refresh that lost the race asked for one more load.
            if !self.dirty.load(Ordering::SeqCst) {
                return Ok(snapshot);
            }
        }
    }

    async fn load(&self) -> Result<Arc<TopologySnapshot>> {
        let maps = self.store.list().await?;
        let snapshot = Arc::new(TopologySnapshot::build(maps));
        for shard_set in snapshot.shard_sets() {
            let report = CoverageReport::build(shard_set, snapshot.all(), self.logical_shard_count(shard_set));
            if !report.valid {
                warn!(
                    shard_set,
                    read_gap = ?report.read.first_gap,
                    write_gap = ?report.write.first_gap,
                    "shard set coverage is incomplete"
                );
            }
        }
        info!(shards = snapshot.all().len(), "topology refreshed");
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        Ok(snapshot)
    }

    pub async fn find_read_shards(&self, shard_set: &str) -> Vec<ShardMap> {
        self.current().await.read_shards(shard_set).to_vec()
    }

    pub async fn find_write_shards(&self, shard_set: &str) -> Vec<ShardMap> {
        self.current().await.write_shards(shard_set).to_vec()
    }

    pub async fn find_all_shards(&self, shard_set: &str) -> Vec<ShardMap> {
        self.current().await.shards(shard_set)
    }

    /// Coverage check for both the read and the write shards of `shard_set`.
    /// Callers about to remove a shard should refuse when this is invalid.
    pub async fn validate(&self, shard_set: &str) -> CoverageReport {
        let snapshot = self.current().await;
        CoverageReport::build(shard_set, snapshot.all(), self.logical_shard_count(shard_set))
    }

    pub async fn create(&self, map: ShardMap) -> Result<ShardMap> {
        let created = self.store.create(map).await?;
        self.refresh(true).await?;
        Ok(created)
    }

    pub async fn update(&self, map: ShardMap) -> Result<ShardMap> {
        let updated = self.store.update(map).await?;
        self.refresh(true).await?;
        Ok(updated)
    }

    pub async fn delete(&self, id: ShardMapId) -> Result<bool> {
        let deleted = self.store.delete(id).await?;
        self.refresh(true).await?;
        Ok(deleted)
    }
}
