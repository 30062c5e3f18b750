//! Background upkeep of a router's shard connections.
use std::sync::Arc;

use shardbase_shard::{ShardMapId, DEFAULT_SHARD_ID};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::{Entity, Result, ShardedDao};

impl<E: Entity> ShardedDao<E> {
    /// Reload the topology and close every cached DAO whose ShardMap is gone.
    /// The fallback shard is never evicted.
    #[instrument(skip(self), fields(shard_set = %self.shard_set.name))]
    pub async fn evict_stale_shards(&self) -> Result<Vec<ShardMapId>> {
        let snapshot = self.topology.refresh(true).await?;
        let mut evicted = Vec::new();
        for id in self.registry.ids() {
            if id == DEFAULT_SHARD_ID || snapshot.contains(id) {
                continue;
            }
            if let Some(dao) = self.registry.evict(id) {
                dao.close().await;
                info!(shard = %id, "closed dao of removed shard");
                evicted.push(id);
            }
        }
        Ok(evicted)
    }

    /// Run [`ShardedDao::evict_stale_shards`] every eviction interval until
    /// the router is dropped.
    pub fn spawn_housekeeping(self: &Arc<Self>) -> JoinHandle<()> {
        let router = Arc::downgrade(self);
        let period = self.config.eviction_interval().max(std::time::Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(router) = router.upgrade() else {
                    debug!("router dropped, stopping housekeeping");
                    break;
                };
                if let Err(e) = router.evict_stale_shards().await {
                    warn!(error = %e, "shard eviction sweep failed");
                }
            }
        })
    }

    /// Load the topology, retrying with backoff while the store is
    /// unavailable, then connect every shard of the set. Returns the number
    /// of shards connected.
    #[instrument(skip(self), fields(shard_set = %self.shard_set.name))]
    pub async fn warm_up(&self) -> Result<usize> {
        let attempts = self.config.warmup_attempts.max(1);
        let mut attempt = 1;
        let snapshot = loop {
            match self.topology.refresh(true).await {
                Ok(snapshot) => break snapshot,
                Err(e) if attempt < attempts => {
                    let delay = self.config.warmup_backoff(attempt);
                    warn!(attempt, error = %e, ?delay, "topology unavailable, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut shards = snapshot.shards(&self.shard_set.name);
        if shards.is_empty() {
            shards.extend(self.fallback.clone());
        }
        let mut connected = 0;
        for shard in shards {
            let id = shard.id;
            match self.connect(shard).await {
                Ok(_) => connected += 1,
                Err(e) => warn!(shard = %id, error = %e, "warm-up connect failed"),
            }
        }
        info!(connected, attempts = attempt, "shard connections warmed up");
        Ok(connected)
    }

    pub fn spawn_warm_up(self: &Arc<Self>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = router.warm_up().await {
                error!(error = %e, "warm-up gave up");
            }
        })
    }
}
