//! Coverage validation: do the readable (or writable) shards of a set span
//! the whole logical index space?
use serde::Serialize;

use crate::{IoMode, ShardMap};

/// Coverage of one access mode.
#[derive(Debug, Clone, Serialize)]
pub struct SetCoverage {
    pub shards: Vec<ShardMap>,
    /// Lowest logical index no shard owns.
    pub first_gap: Option<u32>,
}

impl SetCoverage {
    pub fn valid(&self) -> bool {
        self.first_gap.is_none()
    }
}

/// Result of validating one shard set.
#[derive(Debug, Clone, Serialize)]
pub struct CoverageReport {
    pub shard_set: String,
    pub logical_shard_count: u32,
    pub valid: bool,
    pub read: SetCoverage,
    pub write: SetCoverage,
}

impl CoverageReport {
    /// Validate the read and write subsets of `maps` independently.
    /// Maps belonging to other shard sets are ignored.
    pub fn build(shard_set: &str, maps: &[ShardMap], count: u32) -> Self {
        let read = mode_coverage(shard_set, maps, IoMode::Read, count);
        let write = mode_coverage(shard_set, maps, IoMode::Write, count);
        Self {
            shard_set: shard_set.to_string(),
            logical_shard_count: count,
            valid: read.valid() && write.valid(),
            read,
            write,
        }
    }
}

fn mode_coverage(shard_set: &str, maps: &[ShardMap], mode: IoMode, count: u32) -> SetCoverage {
    let shards: Vec<ShardMap> = maps
        .iter()
        .filter(|m| m.shard_set == shard_set && m.allows(mode))
        .cloned()
        .collect();
    let first_gap = check_coverage(&shards, count);
    SetCoverage { shards, first_gap }
}

/// Sweep ranges in start order and return the first uncovered index, if any.
/// Overlapping ranges are fine.
pub fn check_coverage(maps: &[ShardMap], count: u32) -> Option<u32> {
    let mut ranges: Vec<_> = maps.iter().map(|m| m.range).collect();
    ranges.sort();
    let mut covered = 0u32;
    for range in ranges {
        if range.start > covered {
            return Some(covered);
        }
        covered = covered.max(range.end);
        if covered >= count {
            return None;
        }
    }
    Some(covered)
}
