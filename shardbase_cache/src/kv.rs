//! Key/value cache service contract.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{CacheError, Result};

/// Remote key/value cache with TTLs and list values.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Members of the list at `key`, empty when absent.
    async fn list_get(&self, key: &str) -> Result<Vec<String>>;

    /// Append to the list at `key` and reset its TTL.
    async fn list_push(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
}

enum Value {
    Scalar(String),
    List(Vec<String>),
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process [`KvCache`].
#[derive(Default)]
pub struct MemoryKvCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().await.values().filter(|e| e.live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvCache for MemoryKvCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if entries.get(key).map_or(false, |e| !e.live(now)) {
            entries.remove(key);
        }
        match entries.get(key) {
            Some(Entry { value: Value::Scalar(v), .. }) => Ok(Some(v.clone())),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.live(now));
        entries.insert(key.to_string(), Entry { value: Value::Scalar(value), expires_at: now + ttl });
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn list_get(&self, key: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if !entry.live(Instant::now()) => Ok(Vec::new()),
            Some(Entry { value: Value::List(items), .. }) => Ok(items.clone()),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn list_push(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        // Expired entries are dropped on every write so unread keys do not pile up.
        entries.retain(|_, e| e.live(now));
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::List(Vec::new()), expires_at: now });
        match &mut entry.value {
            Value::List(items) => {
                if !items.contains(&value) {
                    items.push(value);
                }
            }
            Value::Scalar(_) => return Err(CacheError::WrongType(key.to_string())),
        }
        entry.expires_at = now + ttl;
        Ok(())
    }
}
