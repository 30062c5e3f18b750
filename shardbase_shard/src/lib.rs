//! Shard topology data model and logical partitioning for Shardbase.
//!
//! A shard set divides a fixed logical index space (`0..logical_shard_count`)
//! among physical databases. Each [`ShardMap`] claims one half-open
//! [`ShardRange`] of that space; ranges may overlap to replicate data.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod coverage;

pub use coverage::{check_coverage, CoverageReport, SetCoverage};

/// Logical shard count used when a shard set does not pick its own.
pub const DEFAULT_LOGICAL_SHARD_COUNT: u32 = 65_536;

/// Identity of the synthesized fallback shard.
pub const DEFAULT_SHARD_ID: ShardMapId = ShardMapId(0);

/// Result type alias for topology model operations.
pub type Result<T> = std::result::Result<T, ShardError>;

/// Errors raised while building topology records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShardError {
    /// Range is empty or inverted.
    #[error("invalid shard range [{start}, {end})")]
    EmptyRange { start: u32, end: u32 },
    /// Range reaches past the logical index space.
    #[error("shard range [{start}, {end}) exceeds logical shard count {count}")]
    OutOfBounds { start: u32, end: u32, count: u32 },
    /// Logical shard count must be positive.
    #[error("logical shard count must be greater than zero")]
    ZeroShardCount,
}

/// A named partition space for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSet {
    pub name: String,
    pub logical_shard_count: u32,
}

impl ShardSet {
    pub fn new(name: impl Into<String>, logical_shard_count: u32) -> Result<Self> {
        if logical_shard_count == 0 {
            return Err(ShardError::ZeroShardCount);
        }
        Ok(Self { name: name.into(), logical_shard_count })
    }

    /// Logical shard index of `key` within this set.
    pub fn logical_shard(&self, key: &str) -> u32 {
        logical_shard(key, self.logical_shard_count)
    }
}

/// Half-open interval `[start, end)` of logical shard indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardRange {
    pub start: u32,
    pub end: u32,
}

impl ShardRange {
    /// Build a range checked against `count`.
    pub fn new(start: u32, end: u32, count: u32) -> Result<Self> {
        let range = Self { start, end };
        range.check(count)?;
        Ok(range)
    }

    /// The whole index space of a shard set.
    pub fn full(count: u32) -> Self {
        Self { start: 0, end: count }
    }

    pub fn contains(&self, index: u32) -> bool {
        self.start <= index && index < self.end
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Verify `start < end <= count`.
    pub fn check(&self, count: u32) -> Result<()> {
        if self.is_empty() {
            return Err(ShardError::EmptyRange { start: self.start, end: self.end });
        }
        if self.end > count {
            return Err(ShardError::OutOfBounds { start: self.start, end: self.end, count });
        }
        Ok(())
    }
}

/// Stable identity of a [`ShardMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardMapId(pub u64);

impl std::fmt::Display for ShardMapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Whether an operation reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    Read,
    Write,
}

/// Ownership record binding a logical range to one physical database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMap {
    pub id: ShardMapId,
    pub shard_set: String,
    pub range: ShardRange,
    pub connection_url: String,
    #[serde(default = "default_true")]
    pub allow_read: bool,
    #[serde(default = "default_true")]
    pub allow_write: bool,
    #[serde(default)]
    pub default_shard: bool,
}

fn default_true() -> bool {
    true
}

impl ShardMap {
    /// Read/write shard owning `range`.
    pub fn new(id: u64, shard_set: impl Into<String>, range: ShardRange, connection_url: impl Into<String>) -> Self {
        Self {
            id: ShardMapId(id),
            shard_set: shard_set.into(),
            range,
            connection_url: connection_url.into(),
            allow_read: true,
            allow_write: true,
            default_shard: false,
        }
    }

    /// The synthesized shard used when a set has no topology yet.
    pub fn fallback(shard_set: impl Into<String>, connection_url: impl Into<String>, count: u32) -> Self {
        Self {
            id: DEFAULT_SHARD_ID,
            shard_set: shard_set.into(),
            range: ShardRange::full(count),
            connection_url: connection_url.into(),
            allow_read: true,
            allow_write: true,
            default_shard: true,
        }
    }

    pub fn with_access(mut self, allow_read: bool, allow_write: bool) -> Self {
        self.allow_read = allow_read;
        self.allow_write = allow_write;
        self
    }

    pub fn allows(&self, mode: IoMode) -> bool {
        match mode {
            IoMode::Read => self.allow_read,
            IoMode::Write => self.allow_write,
        }
    }

    pub fn owns(&self, index: u32) -> bool {
        self.range.contains(index)
    }
}

/// A record that can be placed on a shard.
///
/// The value of [`Shardable::hash_field`] (typically the owning account),
/// not the record's own id, picks the logical shard, so that everything an
/// owner holds lands on the same shards.
pub trait Shardable {
    /// Name of the field whose value is hashed to a logical shard.
    fn hash_field() -> &'static str;

    /// Stable record identity.
    fn id(&self) -> &str;

    /// String value of a named field, `None` when unset.
    fn field(&self, name: &str) -> Option<String>;

    fn hash_key(&self) -> Option<String> {
        self.field(Self::hash_field()).filter(|v| !v.is_empty())
    }
}

/// Maps partition keys to logical shard indexes.
pub trait Partitioner: Send + Sync {
    fn logical_shard_count(&self) -> u32;

    fn logical_shard(&self, key: &str) -> u32;
}

/// SHA-256 based partitioner. Fixed for the lifetime of a shard set.
#[derive(Debug, Clone, Copy)]
pub struct Sha256Partitioner {
    count: u32,
}

impl Sha256Partitioner {
    pub fn new(count: u32) -> Self {
        Self { count: count.max(1) }
    }
}

impl Default for Sha256Partitioner {
    fn default() -> Self {
        Self::new(DEFAULT_LOGICAL_SHARD_COUNT)
    }
}

impl Partitioner for Sha256Partitioner {
    fn logical_shard_count(&self) -> u32 {
        self.count
    }

    fn logical_shard(&self, key: &str) -> u32 {
        logical_shard(key, self.count)
    }
}

/// First seven hex digits of `sha256(key)`, modulo `count`.
pub fn logical_shard(key: &str, count: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let prefix = (u32::from(digest[0]) << 20)
        | (u32::from(digest[1]) << 12)
        | (u32::from(digest[2]) << 4)
        | (u32::from(digest[3]) >> 4);
    prefix % count.max(1)
}

/// Maps from `maps` that own `index` and permit `mode`.
pub fn owners_of<'a>(maps: &'a [ShardMap], index: u32, mode: IoMode) -> Vec<&'a ShardMap> {
    maps.iter().filter(|m| m.allows(mode) && m.owns(index)).collect()
}
