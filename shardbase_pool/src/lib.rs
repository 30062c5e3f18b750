//! Registry of per-shard handles (connection pools or DAOs built on them).
//!
//! Handles are built lazily, once per ShardMap, and shared by every router
//! holding the same registry. Construction is serialized per ShardMap only:
//! two different shards connect concurrently.
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use shardbase_shard::{ShardMap, ShardMapId};
use tokio::sync::OnceCell;
use tracing::{debug, info};

struct Slot<T: ?Sized> {
    connection_url: String,
    cell: Arc<OnceCell<Arc<T>>>,
}

/// Lookup-or-create registry keyed by ShardMap identity.
pub struct ShardRegistry<T: ?Sized> {
    slots: Mutex<HashMap<ShardMapId, Slot<T>>>,
}

impl<T: ?Sized> Default for ShardRegistry<T> {
    fn default() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }
}

impl<T: ?Sized + Send + Sync> ShardRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Already-built handle for `id`.
    pub fn get(&self, id: ShardMapId) -> Option<Arc<T>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&id).and_then(|slot| slot.cell.get().cloned())
    }

    /// Handle for `map`, running `connect` if none is cached.
    ///
    /// A failed `connect` leaves nothing cached; the next caller retries.
    /// A cached handle whose ShardMap now points at a different URL is
    /// replaced.
    pub async fn get_or_connect<F, Fut, E>(&self, map: &ShardMap, connect: F) -> Result<Arc<T>, E>
    where
        F: FnOnce(ShardMap) -> Fut,
        Fut: Future<Output = Result<Arc<T>, E>>,
    {
        let cell = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = slots.entry(map.id).or_insert_with(|| Slot {
                connection_url: map.connection_url.clone(),
                cell: Arc::new(OnceCell::new()),
            });
            if slot.connection_url != map.connection_url {
                info!(shard = %map.id, url = %map.connection_url, "shard connection url changed, reconnecting");
                *slot = Slot { connection_url: map.connection_url.clone(), cell: Arc::new(OnceCell::new()) };
            }
            slot.cell.clone()
        };
        let handle = cell
            .get_or_try_init(|| {
                debug!(shard = %map.id, url = %map.connection_url, "connecting shard");
                connect(map.clone())
            })
            .await?;
        Ok(handle.clone())
    }

    /// Remove and return the handle for `id`.
    pub fn evict(&self, id: ShardMapId) -> Option<Arc<T>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(&id).and_then(|slot| slot.cell.get().cloned())
    }

    /// Ids with a built handle.
    pub fn ids(&self) -> Vec<ShardMapId> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = slots.iter().filter(|(_, s)| s.cell.initialized()).map(|(id, _)| *id).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
