use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use directories::BaseDirs;
use serde::Deserialize;
use shardbase_dao::RouteExplain;
use shardbase_meta::{MemoryTopologyStore, TopologyCache, TopologyConfig};
use shardbase_shard::{CoverageReport, ShardMap, ShardSet, DEFAULT_LOGICAL_SHARD_COUNT};
use tracing::{debug, warn};

/// Shardbase topology tool.
#[derive(Parser)]
#[command(name = "shardbasectl", author, version, about = "Shardbase topology tool", long_about = None)]
struct Cli {
    /// Log level for diagnostics on stderr.
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the logical shard index of a key.
    Shard {
        #[arg(long)]
        key: String,
        #[arg(long, default_value_t = DEFAULT_LOGICAL_SHARD_COUNT)]
        count: u32,
    },

    /// Check that every shard set of a topology covers all logical shards.
    Validate {
        /// Topology file (default: $HOME/.shardbase/topology.yaml).
        #[arg(long)]
        topology: Option<PathBuf>,
        /// Only check this shard set.
        #[arg(long)]
        shard_set: Option<String>,
    },

    /// Show the read and write shards a key routes to.
    Route {
        #[arg(long)]
        topology: Option<PathBuf>,
        #[arg(long)]
        shard_set: String,
        #[arg(long)]
        key: String,
    },
}

/// Topology description as kept by operators.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TopologyFile {
    master_url: Option<String>,
    shard_sets: Vec<ShardSetEntry>,
    shards: Vec<ShardMap>,
}

#[derive(Debug, Deserialize)]
struct ShardSetEntry {
    name: String,
    #[serde(default = "default_count")]
    logical_shard_count: u32,
}

fn default_count() -> u32 {
    DEFAULT_LOGICAL_SHARD_COUNT
}

impl TopologyFile {
    fn load(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    fn count_of(&self, name: &str) -> u32 {
        self.shard_sets
            .iter()
            .find(|s| s.name == name)
            .map_or(DEFAULT_LOGICAL_SHARD_COUNT, |s| s.logical_shard_count)
    }

    /// Declared sets plus any set a shard refers to.
    fn set_names(&self) -> BTreeSet<String> {
        self.shard_sets
            .iter()
            .map(|s| s.name.clone())
            .chain(self.shards.iter().map(|m| m.shard_set.clone()))
            .collect()
    }

    async fn cache(&self) -> Result<TopologyCache> {
        let store = MemoryTopologyStore::with_maps(self.shards.clone()).await?;
        let cache = TopologyCache::new(Arc::new(store), TopologyConfig::default());
        for name in self.set_names() {
            let count = self.count_of(&name);
            cache.register_shard_set(&ShardSet::new(name, count)?);
        }
        let snapshot = cache.refresh(true).await?;
        debug!(shards = snapshot.all().len(), "topology loaded");
        Ok(cache)
    }
}

fn topology_path(given: Option<PathBuf>) -> Result<PathBuf> {
    given
        .or_else(|| BaseDirs::new().map(|b| b.home_dir().join(".shardbase").join("topology.yaml")))
        .ok_or_else(|| anyhow!("no --topology given and no home directory to look in"))
}

async fn coverage(file: &TopologyFile, only: Option<&str>) -> Result<Vec<CoverageReport>> {
    let cache = file.cache().await?;
    let names = file.set_names();
    if let Some(name) = only {
        if !names.contains(name) {
            bail!("shard set `{name}` is not in the topology");
        }
    }
    let mut reports = Vec::new();
    for name in names.iter().filter(|n| only.map_or(true, |o| o == n.as_str())) {
        reports.push(cache.validate(name).await);
    }
    Ok(reports)
}

async fn explain(file: &TopologyFile, shard_set: &str, key: &str) -> Result<RouteExplain> {
    if key.is_empty() {
        bail!("key must not be empty");
    }
    let cache = file.cache().await?;
    let set = ShardSet::new(shard_set, file.count_of(shard_set))?;
    let fallback = file
        .master_url
        .as_ref()
        .map(|url| ShardMap::fallback(shard_set, url, set.logical_shard_count));
    Ok(RouteExplain::build(&cache.snapshot(), &set, key, fallback.as_ref()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    shardbase_log::init_stderr(shardbase_log::parse_level(&cli.log_level)?)?;
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    match cli.command {
        Commands::Shard { key, count } => {
            let set = ShardSet::new("cli", count)?;
            println!("logical_shard={}", set.logical_shard(&key));
        }

        Commands::Validate { topology, shard_set } => {
            let file = TopologyFile::load(&topology_path(topology)?)?;
            let reports = rt.block_on(coverage(&file, shard_set.as_deref()))?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            let invalid: Vec<&str> = reports.iter().filter(|r| !r.valid).map(|r| r.shard_set.as_str()).collect();
            if !invalid.is_empty() {
                bail!("incomplete coverage for {}", invalid.join(", "));
            }
        }

        Commands::Route { topology, shard_set, key } => {
            let file = TopologyFile::load(&topology_path(topology)?)?;
            let route = rt.block_on(explain(&file, &shard_set, &key))?;
            if !route.routable() {
                warn!(shard_set = %shard_set, logical_shard = route.logical_shard, "key is not fully routable");
            }
            println!("{}", serde_json::to_string_pretty(&route)?);
        }
    }
    Ok(())
}
