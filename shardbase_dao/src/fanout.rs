//! Parallel cross-shard query execution.
//!
//! A query that cannot be routed by the hash key runs once per distinct
//! logical range, never once per replica. Tasks run on the shared runtime,
//! bounded by a per-router semaphore, and every task still running when a
//! call returns is aborted.
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use shardbase_shard::{ShardMap, ShardRange};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument, warn};

use crate::{DaoError, Entity, Result, ShardQuery, ShardTarget, ShardedDaoError};

/// One representative per distinct range, picked at random among replicas.
/// Output is ordered by range.
pub fn non_overlapping(shards: &[ShardMap]) -> Vec<ShardMap> {
    let mut groups: BTreeMap<ShardRange, Vec<&ShardMap>> = BTreeMap::new();
    for shard in shards {
        groups.entry(shard.range).or_default().push(shard);
    }
    let mut rng = rand::thread_rng();
    groups
        .into_values()
        .filter_map(|replicas| replicas.choose(&mut rng).map(|m| (*m).clone()))
        .collect()
}

/// Outcome of a unique fan-out lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<E> {
    Found(E),
    /// Every shard answered and none matched.
    Absent,
    /// No match among the shards that answered, but some failed or ran out
    /// of time.
    Unknown,
}

impl<E> Lookup<E> {
    pub fn into_option(self) -> Option<E> {
        match self {
            Self::Found(found) => Some(found),
            Self::Absent | Self::Unknown => None,
        }
    }

    /// Whether the answer holds for the whole shard set.
    pub fn is_conclusive(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Runs a [`ShardQuery`] on many shards at once.
pub struct FanOutExecutor {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl FanOutExecutor {
    /// `pool_size` caps the cross-shard tasks in flight across all calls.
    pub fn new(pool_size: usize, timeout: Duration) -> Self {
        Self { permits: Arc::new(Semaphore::new(pool_size.max(1))), timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// First non-empty answer from any shard.
    ///
    /// Shard failures count as "no result". Reaching the deadline is a
    /// [`ShardedDaoError::Timeout`] when no shard answered at all; once at
    /// least one shard reported no match, the stragglers are dropped and the
    /// lookup is [`Lookup::Unknown`].
    #[instrument(skip(self, targets), fields(shards = targets.len()))]
    pub async fn query_unique<E: Entity>(&self, targets: Vec<ShardTarget<E>>, query: ShardQuery) -> Result<Lookup<E>> {
        let shards = targets.len();
        let started = Instant::now();
        let deadline = started + self.timeout;
        let query = Arc::new(query);
        let mut tasks = JoinSet::new();
        for target in targets {
            let permits = self.permits.clone();
            let query = query.clone();
            tasks.spawn(async move {
                let id = target.shard.id;
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (id, Err(DaoError::Backend("fan-out pool closed".into()))),
                };
                (id, query.unique(&*target.dao).await)
            });
        }

        let mut answered = 0usize;
        let mut degraded = false;
        let outcome = loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((id, Ok(Some(found)))))) => {
                    debug!(shard = %id, "fan-out lookup hit");
                    break Ok(Lookup::Found(found));
                }
                Ok(Some(Ok((_, Ok(None))))) => answered += 1,
                Ok(Some(Ok((id, Err(e))))) => {
                    answered += 1;
                    degraded = true;
                    warn!(shard = %id, error = %e, "shard lookup failed, treating as no result");
                }
                Ok(Some(Err(e))) => {
                    answered += 1;
                    degraded = true;
                    warn!(error = %e, "shard lookup task aborted");
                }
                Ok(None) if degraded => break Ok(Lookup::Unknown),
                Ok(None) => break Ok(Lookup::Absent),
                Err(_) if answered == 0 => {
                    break Err(ShardedDaoError::Timeout { shards, elapsed: started.elapsed() });
                }
                Err(_) => {
                    warn!(answered, pending = tasks.len(), "fan-out lookup deadline reached, treating as miss");
                    break Ok(Lookup::Unknown);
                }
            }
        };
        tasks.abort_all();
        outcome
    }

    /// Rows from every shard, up to `max_results`, deduplicated by id.
    ///
    /// Failed shards are logged and skipped. At the deadline the rows
    /// collected so far are returned.
    #[instrument(skip(self, targets), fields(shards = targets.len()))]
    pub async fn query_list<E: Entity>(
        &self,
        targets: Vec<ShardTarget<E>>,
        query: ShardQuery,
        max_results: usize,
    ) -> Result<Vec<E>> {
        let deadline = Instant::now() + self.timeout;
        let query = Arc::new(query);
        let mut tasks = JoinSet::new();
        for target in targets {
            let permits = self.permits.clone();
            let query = query.clone();
            tasks.spawn(async move {
                let id = target.shard.id;
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (id, Err(DaoError::Backend("fan-out pool closed".into()))),
                };
                (id, query.list(&*target.dao, max_results).await)
            });
        }

        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        while rows.len() < max_results {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((_, Ok(found))))) => {
                    for row in found {
                        if rows.len() < max_results && seen.insert(row.id().to_string()) {
                            rows.push(row);
                        }
                    }
                }
                Ok(Some(Ok((id, Err(e))))) => warn!(shard = %id, error = %e, "shard query failed, skipping"),
                Ok(Some(Err(e))) => warn!(error = %e, "shard query task aborted, skipping"),
                Ok(None) => break,
                Err(_) => {
                    warn!(collected = rows.len(), pending = tasks.len(), "fan-out list timed out, returning partial results");
                    break;
                }
            }
        }
        tasks.abort_all();
        Ok(rows)
    }
}
