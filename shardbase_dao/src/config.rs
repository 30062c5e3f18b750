//! Router configuration, loaded from YAML.
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use shardbase_meta::TopologyConfig;
use shardbase_shard::DEFAULT_LOGICAL_SHARD_COUNT;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings of one sharded entity router.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    pub shard_set: String,
    /// Fixed at shard-set creation. Changing it remaps every key.
    pub logical_shard_count: u32,
    /// Connection URL of the fallback shard used while no topology exists.
    pub master_url: Option<String>,
    pub topology_refresh_secs: u64,
    /// Max cross-shard tasks in flight per router.
    pub fanout_pool_size: usize,
    pub fanout_timeout_ms: u64,
    /// Defaults to the shard set name.
    pub cache_namespace: Option<String>,
    pub cache_ttl_secs: u64,
    pub eviction_interval_secs: u64,
    pub warmup_attempts: u32,
    pub warmup_backoff_ms: u64,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_set: String::new(),
            logical_shard_count: DEFAULT_LOGICAL_SHARD_COUNT,
            master_url: None,
            topology_refresh_secs: 60 * 60,
            fanout_pool_size: 16,
            fanout_timeout_ms: 10_000,
            cache_namespace: None,
            cache_ttl_secs: 60 * 60,
            eviction_interval_secs: 24 * 60 * 60,
            warmup_attempts: 10,
            warmup_backoff_ms: 250,
        }
    }
}

/// Cap on the cold-start retry delay.
pub const MAX_WARMUP_BACKOFF: Duration = Duration::from_secs(30);

impl ShardingConfig {
    pub fn new(shard_set: impl Into<String>) -> Self {
        Self { shard_set: shard_set.into(), ..Self::default() }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: ShardingConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_set.is_empty() {
            return Err(ConfigError::Invalid("shard_set must be set".into()));
        }
        if self.logical_shard_count == 0 {
            return Err(ConfigError::Invalid("logical_shard_count must be positive".into()));
        }
        if self.fanout_pool_size == 0 {
            return Err(ConfigError::Invalid("fanout_pool_size must be positive".into()));
        }
        Ok(())
    }

    pub fn namespace(&self) -> &str {
        self.cache_namespace.as_deref().unwrap_or(&self.shard_set)
    }

    pub fn topology(&self) -> TopologyConfig {
        TopologyConfig {
            refresh_interval: Duration::from_secs(self.topology_refresh_secs),
            logical_shard_count: self.logical_shard_count,
        }
    }

    pub fn fanout_timeout(&self) -> Duration {
        Duration::from_millis(self.fanout_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    /// Delay before cold-start retry number `attempt` (1-based).
    pub fn warmup_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.warmup_backoff_ms.saturating_mul(factor)).min(MAX_WARMUP_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_with_defaults() {
        let config = ShardingConfig::from_yaml("shard_set: accounts\nmaster_url: postgres://master/app\nfanout_pool_size: 4\n").unwrap();
        assert_eq!(config.shard_set, "accounts");
        assert_eq!(config.logical_shard_count, 65_536);
        assert_eq!(config.fanout_pool_size, 4);
        assert_eq!(config.namespace(), "accounts");
        assert_eq!(config.topology().refresh_interval, Duration::from_secs(3_600));
        assert_eq!(config.eviction_interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn rejects_missing_shard_set() {
        assert!(matches!(ShardingConfig::from_yaml("fanout_pool_size: 4\n"), Err(ConfigError::Invalid(_))));
        assert!(matches!(ShardingConfig::from_yaml("shard_set: [\n"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ShardingConfig::new("accounts");
        assert_eq!(config.warmup_backoff(1), Duration::from_millis(250));
        assert_eq!(config.warmup_backoff(2), Duration::from_millis(500));
        assert_eq!(config.warmup_backoff(4), Duration::from_millis(2_000));
        assert_eq!(config.warmup_backoff(20), MAX_WARMUP_BACKOFF);
    }
}
