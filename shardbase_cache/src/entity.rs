//! Namespaced entity cache with reverse-index invalidation.
//!
//! Every cached lookup records its key under `refs:<uuid>` for each entity it
//! returned, or under the shared `refs:null` bucket when it found nothing.
//! Invalidating a uuid deletes every key listed under it plus the null
//! bucket, because a write can turn an earlier miss into a hit.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use shardbase_shard::Shardable;
use tracing::{debug, warn};

use crate::{KvCache, Result};

const NULL_REFS: &str = "null";

/// Per-entity-type view over a [`KvCache`].
#[derive(Clone)]
pub struct EntityCache {
    kv: Arc<dyn KvCache>,
    namespace: String,
    ttl: Duration,
}

impl EntityCache {
    pub fn new(kv: Arc<dyn KvCache>, namespace: impl Into<String>, ttl: Duration) -> Self {
        Self { kv, namespace: namespace.into(), ttl }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn refs_key(&self, uuid: &str) -> String {
        format!("{}:refs:{}", self.namespace, uuid)
    }

    /// Cached result of `loader` under `key`. Misses are cached too.
    ///
    /// Cache failures never fail the lookup: they are logged and the loader
    /// answers instead.
    pub async fn lookup<E, F, Fut, Err>(&self, key: &str, loader: F) -> std::result::Result<Option<E>, Err>
    where
        E: Shardable + Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<E>, Err>>,
    {
        self.lookup_if(key, move || async move { loader().await.map(|found| (found, true)) }).await
    }

    /// Like [`EntityCache::lookup`], but `loader` also says whether its
    /// answer may be cached. Answers it flags as partial are returned and
    /// forgotten.
    pub async fn lookup_if<E, F, Fut, Err>(&self, key: &str, loader: F) -> std::result::Result<Option<E>, Err>
    where
        E: Shardable + Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(Option<E>, bool), Err>>,
    {
        let entry_key = self.entry_key(key);
        match self.read::<Option<E>>(&entry_key).await {
            Ok(Some(hit)) => {
                debug!(key = %entry_key, found = hit.is_some(), "cache hit");
                return Ok(hit);
            }
            Ok(None) => {}
            Err(e) => warn!(key = %entry_key, error = %e, "cache read failed"),
        }
        let (loaded, cacheable) = loader().await?;
        if !cacheable {
            debug!(key = %entry_key, "partial answer, not caching");
            return Ok(loaded);
        }
        let uuids: Vec<&str> = loaded.iter().map(|e| e.id()).collect();
        if let Err(e) = self.write(&entry_key, &loaded, &uuids).await {
            warn!(key = %entry_key, error = %e, "cache write failed");
        }
        Ok(loaded)
    }

    /// Like [`EntityCache::lookup`] for list results.
    pub async fn lookup_list<E, F, Fut, Err>(&self, key: &str, loader: F) -> std::result::Result<Vec<E>, Err>
    where
        E: Shardable + Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<E>, Err>>,
    {
        let entry_key = self.entry_key(key);
        match self.read::<Vec<E>>(&entry_key).await {
            Ok(Some(hit)) => {
                debug!(key = %entry_key, rows = hit.len(), "cache hit");
                return Ok(hit);
            }
            Ok(None) => {}
            Err(e) => warn!(key = %entry_key, error = %e, "cache read failed"),
        }
        let loaded = loader().await?;
        let uuids: Vec<&str> = loaded.iter().map(|e| e.id()).collect();
        if let Err(e) = self.write(&entry_key, &loaded, &uuids).await {
            warn!(key = %entry_key, error = %e, "cache write failed");
        }
        Ok(loaded)
    }

    async fn read<T: DeserializeOwned>(&self, entry_key: &str) -> Result<Option<T>> {
        match self.kv.get(entry_key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, entry_key: &str, value: &T, uuids: &[&str]) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        // References go in first so an invalidation racing this write
        // cannot leave an unreferenced entry behind.
        if uuids.is_empty() {
            self.kv.list_push(&self.refs_key(NULL_REFS), entry_key.to_string(), self.ttl).await?;
        }
        for uuid in uuids {
            self.kv.list_push(&self.refs_key(uuid), entry_key.to_string(), self.ttl).await?;
        }
        self.kv.set(entry_key, raw, self.ttl).await
    }

    /// Drop every cached lookup derived from `uuid`, and all cached misses.
    pub async fn invalidate(&self, uuid: &str) -> Result<()> {
        for refs in [self.refs_key(uuid), self.refs_key(NULL_REFS)] {
            let keys = self.kv.list_get(&refs).await?;
            debug!(refs = %refs, keys = keys.len(), "invalidating cache keys");
            for key in keys {
                self.kv.del(&key).await?;
            }
            self.kv.del(&refs).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKvCache;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        owner: String,
        slug: String,
    }

    impl Shardable for Note {
        fn hash_field() -> &'static str {
            "owner"
        }
        fn id(&self) -> &str {
            &self.id
        }
        fn field(&self, name: &str) -> Option<String> {
            match name {
                "id" => Some(self.id.clone()),
                "owner" => Some(self.owner.clone()),
                "slug" => Some(self.slug.clone()),
                _ => None,
            }
        }
    }

    fn note(id: &str, slug: &str) -> Note {
        Note { id: id.into(), owner: "acct-1".into(), slug: slug.into() }
    }

    fn cache() -> EntityCache {
        EntityCache::new(Arc::new(MemoryKvCache::new()), "notes", Duration::from_secs(60))
    }

    #[tokio::test]
    async fn hit_skips_loader() {
        let cache = cache();
        let loads = AtomicUsize::new(0);
        let counter = &loads;
        for _ in 0..3 {
            let found: Option<Note> = cache
                .lookup("unique:slug:a", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(Some(note("n1", "a")))
                })
                .await
                .unwrap();
            assert_eq!(found.unwrap().id, "n1");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_drops_derived_keys() {
        let cache = cache();
        let loads = AtomicUsize::new(0);
        let counter = &loads;
        let load = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(Some(note("n1", "a")))
        };
        cache.lookup::<Note, _, _, _>("unique:slug:a", load).await.unwrap();
        cache.lookup::<Note, _, _, _>("id:n1", load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        cache.invalidate("n2").await.unwrap();
        cache.lookup::<Note, _, _, _>("id:n1", load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        cache.invalidate("n1").await.unwrap();
        cache.lookup::<Note, _, _, _>("unique:slug:a", load).await.unwrap();
        cache.lookup::<Note, _, _, _>("id:n1", load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn misses_are_cached_until_any_write() {
        let cache = cache();
        let loads = AtomicUsize::new(0);
        let counter = &loads;
        let miss = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<Option<Note>, ()>(None)
        };
        assert!(cache.lookup("unique:slug:zz", miss).await.unwrap().is_none());
        assert!(cache.lookup("unique:slug:zz", miss).await.unwrap().is_none());
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        cache.invalidate("anything").await.unwrap();
        assert!(cache.lookup("unique:slug:zz", miss).await.unwrap().is_none());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn list_lookup_references_every_row() {
        let cache = cache();
        let loads = AtomicUsize::new(0);
        let counter = &loads;
        let load = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(vec![note("n1", "a"), note("n2", "b")])
        };
        assert_eq!(cache.lookup_list("field:owner:acct-1", load).await.unwrap().len(), 2);
        cache.lookup_list("field:owner:acct-1", load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        cache.invalidate("n2").await.unwrap();
        cache.lookup_list("field:owner:acct-1", load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn partial_answers_are_not_cached() {
        let cache = cache();
        let loads = AtomicUsize::new(0);
        let counter = &loads;
        let partial = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(Option<Note>, bool), ()>((None, false))
        };
        assert!(cache.lookup_if("unique:slug:a", partial).await.unwrap().is_none());
        assert!(cache.lookup_if("unique:slug:a", partial).await.unwrap().is_none());
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        let found = cache
            .lookup_if("unique:slug:a", || async { Ok::<_, ()>((Some(note("n1", "a")), true)) })
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, "n1");
        assert!(cache.lookup_if("unique:slug:a", partial).await.unwrap().is_some());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn loader_errors_are_not_cached() {
        let cache = cache();
        let err = cache
            .lookup::<Note, _, _, _>("id:n1", || async { Err::<Option<Note>, _>("shard down") })
            .await;
        assert_eq!(err.unwrap_err(), "shard down");
        let ok = cache
            .lookup::<Note, _, _, _>("id:n1", || async { Ok::<_, &str>(Some(note("n1", "a"))) })
            .await
            .unwrap();
        assert!(ok.is_some());
    }
}
