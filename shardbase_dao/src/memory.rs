//! In-memory single-shard DAOs. Each connection URL names one database that
//! outlives the DAOs opened against it.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use shardbase_shard::ShardMap;
use tokio::sync::RwLock;

use crate::{DaoError, Entity, ShardDao, ShardDaoFactory};

/// Rows of one simulated physical database.
pub struct MemoryDatabase<E> {
    url: String,
    rows: RwLock<BTreeMap<String, E>>,
    queries: AtomicUsize,
    offline: AtomicBool,
}

impl<E: Entity> MemoryDatabase<E> {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            rows: RwLock::new(BTreeMap::new()),
            queries: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of operations served so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// While offline every operation fails with [`DaoError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.rows.read().await.contains_key(id)
    }

    fn begin(&self) -> Result<(), DaoError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(DaoError::Unavailable { url: self.url.clone(), reason: "offline".into() });
        }
        Ok(())
    }
}

/// DAO bound to one [`MemoryDatabase`].
pub struct MemoryShardDao<E> {
    shard: ShardMap,
    db: Arc<MemoryDatabase<E>>,
    closed: AtomicBool,
}

impl<E: Entity> MemoryShardDao<E> {
    pub fn new(shard: ShardMap, db: Arc<MemoryDatabase<E>>) -> Self {
        Self { shard, db, closed: AtomicBool::new(false) }
    }

    pub fn shard(&self) -> &ShardMap {
        &self.shard
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<(), DaoError> {
        if self.is_closed() {
            return Err(DaoError::Unavailable { url: self.db.url.clone(), reason: "connection closed".into() });
        }
        self.db.begin()
    }
}

fn field_equals<E: Entity>(row: &E, field: &str, value: &str) -> bool {
    row.field(field).as_deref() == Some(value)
}

#[async_trait]
impl<E: Entity> ShardDao<E> for MemoryShardDao<E> {
    async fn create(&self, entity: &E) -> Result<E, DaoError> {
        self.begin()?;
        let mut rows = self.db.rows.write().await;
        if rows.contains_key(entity.id()) {
            return Err(DaoError::Duplicate(entity.id().to_string()));
        }
        rows.insert(entity.id().to_string(), entity.clone());
        Ok(entity.clone())
    }

    async fn update(&self, entity: &E) -> Result<E, DaoError> {
        self.begin()?;
        let mut rows = self.db.rows.write().await;
        match rows.get_mut(entity.id()) {
            Some(row) => {
                *row = entity.clone();
                Ok(entity.clone())
            }
            None => Err(DaoError::NotFound(entity.id().to_string())),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, DaoError> {
        self.begin()?;
        Ok(self.db.rows.write().await.remove(id).is_some())
    }

    async fn get(&self, id: &str) -> Result<Option<E>, DaoError> {
        self.begin()?;
        Ok(self.db.rows.read().await.get(id).cloned())
    }

    async fn find_by_unique_field(&self, field: &str, value: &str) -> Result<Option<E>, DaoError> {
        self.begin()?;
        let rows = self.db.rows.read().await;
        Ok(rows.values().find(|row| field_equals(*row, field, value)).cloned())
    }

    async fn find_by_field(&self, field: &str, value: &str, limit: usize) -> Result<Vec<E>, DaoError> {
        self.begin()?;
        let rows = self.db.rows.read().await;
        Ok(rows.values().filter(|row| field_equals(*row, field, value)).take(limit).cloned().collect())
    }

    async fn find_all(&self, limit: usize) -> Result<Vec<E>, DaoError> {
        self.begin()?;
        Ok(self.db.rows.read().await.values().take(limit).cloned().collect())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Opens [`MemoryShardDao`]s, one database per connection URL.
pub struct MemoryShardDaoFactory<E> {
    databases: Mutex<HashMap<String, Arc<MemoryDatabase<E>>>>,
    opened: AtomicUsize,
}

impl<E> Default for MemoryShardDaoFactory<E> {
    fn default() -> Self {
        Self { databases: Mutex::new(HashMap::new()), opened: AtomicUsize::new(0) }
    }
}

impl<E: Entity> MemoryShardDaoFactory<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Database behind `url`, created empty on first use.
    pub fn database(&self, url: &str) -> Arc<MemoryDatabase<E>> {
        let mut databases = self.databases.lock().unwrap_or_else(PoisonError::into_inner);
        databases.entry(url.to_string()).or_insert_with(|| Arc::new(MemoryDatabase::new(url))).clone()
    }

    /// Number of DAOs opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<E: Entity> ShardDaoFactory<E> for MemoryShardDaoFactory<E> {
    async fn open(&self, shard: &ShardMap) -> Result<Arc<dyn ShardDao<E>>, DaoError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let db = self.database(&shard.connection_url);
        Ok(Arc::new(MemoryShardDao::new(shard.clone(), db)))
    }
}
