//! Test records and topology builders.
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardbase_cache::MemoryKvCache;
use shardbase_meta::{MemoryTopologyStore, TopologyCache, TopologyConfig};
use shardbase_pool::ShardRegistry;
use shardbase_shard::{ShardMap, ShardRange, Shardable};

use crate::{MemoryShardDaoFactory, ShardedDao, ShardingConfig};

pub const SET: &str = "docs";
pub const COUNT: u32 = 256;
pub const MASTER: &str = "mem://master";

/// A document owned by an account; the account picks the shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doc {
    pub id: String,
    pub account: String,
    pub email: String,
    pub title: String,
}

impl Shardable for Doc {
    fn hash_field() -> &'static str {
        "account"
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "account" => Some(self.account.clone()),
            "email" => Some(self.email.clone()),
            "title" => Some(self.title.clone()),
            _ => None,
        }
    }
}

pub fn doc(id: &str, account: &str, email: &str) -> Doc {
    Doc { id: id.into(), account: account.into(), email: email.into(), title: String::new() }
}

pub fn shard(id: u64, start: u32, end: u32) -> ShardMap {
    ShardMap::new(id, SET, ShardRange { start, end }, format!("mem://shard-{id}"))
}

/// First generated key whose logical shard satisfies `pred`.
pub fn key_where(pred: impl Fn(u32) -> bool) -> String {
    (0..)
        .map(|i| format!("acct-{i}"))
        .find(|k| pred(shardbase_shard::logical_shard(k, COUNT)))
        .unwrap_or_default()
}

pub struct Harness {
    pub dao: Arc<ShardedDao<Doc>>,
    pub factory: Arc<MemoryShardDaoFactory<Doc>>,
    pub store: Arc<MemoryTopologyStore>,
    pub kv: Arc<MemoryKvCache>,
}

pub fn config() -> ShardingConfig {
    ShardingConfig {
        logical_shard_count: COUNT,
        master_url: Some(MASTER.into()),
        fanout_timeout_ms: 2_000,
        ..ShardingConfig::new(SET)
    }
}

pub async fn harness(maps: Vec<ShardMap>) -> Harness {
    harness_with(maps, config()).await
}

pub async fn harness_with(maps: Vec<ShardMap>, config: ShardingConfig) -> Harness {
    let store = Arc::new(MemoryTopologyStore::with_maps(maps).await.unwrap());
    let topology = Arc::new(TopologyCache::new(
        store.clone(),
        TopologyConfig { refresh_interval: Duration::from_secs(3_600), logical_shard_count: COUNT },
    ));
    let factory = Arc::new(MemoryShardDaoFactory::new());
    let kv = Arc::new(MemoryKvCache::new());
    let dao = ShardedDao::new(config, topology, Arc::new(ShardRegistry::new()), factory.clone(), kv.clone()).unwrap();
    Harness { dao: Arc::new(dao), factory, store, kv }
}
