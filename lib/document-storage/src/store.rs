//! The data store façade: id generation, write-through storage, removal,
//! cache-backed keyed reads and query session creation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value as Json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    Document, DocumentBackend, Key, KeyGenerator, QueryableSequence, RandomStringKeys,
    ReadThroughCache, StorageError, StoreConfig,
};

type CacheKey<K> = (&'static str, K);

/// A data store for documents keyed by `K`, over any [`DocumentBackend`].
///
/// Create one per logical backend connection and share it; the cache lives
/// as long as the store.
pub struct DataStore<K: Key, G> {
    backend: Arc<dyn DocumentBackend>,
    keys: G,
    cache: Option<ReadThroughCache<CacheKey<K>, Json>>,
    write_locks: DashMap<CacheKey<K>, Arc<Mutex<()>>>,
    config: StoreConfig,
}

/// A store keyed by random string ids.
pub type StringDataStore = DataStore<String, RandomStringKeys>;

impl DataStore<String, RandomStringKeys> {
    /// A string-keyed store with default configuration.
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self::with_config(backend, RandomStringKeys, StoreConfig::default())
    }
}

impl<K: Key, G: KeyGenerator<K>> DataStore<K, G> {
    pub fn with_config(backend: Arc<dyn DocumentBackend>, keys: G, config: StoreConfig) -> Self {
        let cache = config
            .caching
            .then(|| ReadThroughCache::new(config.cache.clone()));
        Self {
            backend,
            keys,
            cache,
            write_locks: DashMap::new(),
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether keyed reads are served through the cache.
    pub fn supports_caching(&self) -> bool {
        self.cache.is_some()
    }

    /// TTL applied to cache entries when an operation does not supply one.
    pub fn default_cache_timeout(&self) -> Duration {
        self.config.default_cache_timeout
    }

    pub fn set_default_cache_timeout(&mut self, timeout: Duration) {
        self.config.default_cache_timeout = timeout;
    }

    /// A fresh key for a new document of type `T`.
    pub fn create_new_id<T: Document<Key = K>>(&self) -> Option<K> {
        self.keys.new_key_for::<T>()
    }

    /// A fresh key for a document of the named runtime type.
    pub fn create_new_id_for_type(&self, type_name: &str) -> Option<K> {
        self.keys.new_key_for_type(type_name)
    }

    /// The key of an already identified item.
    pub fn get_key<T: Document<Key = K>>(&self, item: &T) -> K {
        item.key()
    }

    /// Fetch an item by key, from the cache when a live entry exists.
    ///
    /// An empty key or an absent document yields `None`.
    pub async fn get_item<T: Document<Key = K>>(
        &self,
        id: &K,
        cache_timeout: Option<Duration>,
    ) -> Result<Option<T>, StorageError> {
        if id.is_empty() {
            return Ok(None);
        }
        let collection = T::collection();
        let storage_id = id.storage_id();
        let backend = &self.backend;
        let load = || async move { backend.load(collection, &storage_id).await };

        let document = match &self.cache {
            Some(cache) => {
                let ttl = cache_timeout.unwrap_or(self.config.default_cache_timeout);
                cache
                    .get_or_load((collection, id.clone()), Some(ttl), load)
                    .await?
            }
            None => load().await?,
        };
        document
            .map(serde_json::from_value)
            .transpose()
            .map_err(StorageError::from)
    }

    /// Persist an item and refresh its cache entry. Returns the stored item.
    pub async fn store_item<T: Document<Key = K>>(
        &self,
        item: T,
        cache_timeout: Option<Duration>,
    ) -> Result<T, StorageError> {
        let key = item.key();
        let collection = T::collection();
        let document = serde_json::to_value(&item)?;
        debug!(collection, key = ?key, "storing item");

        let Some(cache) = &self.cache else {
            self.backend
                .store(collection, &key.storage_id(), document)
                .await?;
            return Ok(item);
        };

        let ttl = cache_timeout.unwrap_or(self.config.default_cache_timeout);
        let cache_key = (collection, key);
        self.serialized(&cache_key, async {
            let pending = PendingWrite::new(cache, &cache_key);
            self.backend
                .store(collection, &cache_key.1.storage_id(), document.clone())
                .await?;
            pending.commit(document, ttl);
            Ok::<_, StorageError>(())
        })
        .await?;
        Ok(item)
    }

    /// Delete an item. Returns `true` once the deletion is committed.
    pub async fn remove_item<T: Document<Key = K>>(&self, item: &T) -> Result<bool, StorageError> {
        self.delete(T::collection(), item.key()).await?;
        Ok(true)
    }

    /// Delete by key. An empty key returns `false` without contacting the
    /// backend; deleting an absent document still returns `true`.
    pub async fn remove_item_by_id<T: Document<Key = K>>(&self, id: &K) -> Result<bool, StorageError> {
        if id.is_empty() {
            return Ok(false);
        }
        self.delete(T::collection(), id.clone()).await?;
        Ok(true)
    }

    /// Open a query session over `T`'s collection.
    ///
    /// The caller owns the returned sequence; dropping or closing it
    /// releases the session.
    pub async fn query<T: Document<Key = K>>(&self) -> Result<QueryableSequence<T>, StorageError> {
        let collection = T::collection();
        debug!(collection, "opening query session");
        let session = self.backend.open_query(collection).await?;
        Ok(QueryableSequence::new(session, collection))
    }

    async fn delete(&self, collection: &'static str, key: K) -> Result<(), StorageError> {
        debug!(collection, key = ?key, "removing item");
        let storage_id = key.storage_id();

        let Some(cache) = &self.cache else {
            return self.backend.delete(collection, &storage_id).await;
        };

        let cache_key = (collection, key);
        self.serialized(&cache_key, async {
            // Dropping the guard invalidates the key, also when the delete
            // fails or is cancelled.
            let _pending = PendingWrite::new(cache, &cache_key);
            self.backend.delete(collection, &storage_id).await
        })
        .await
    }

    /// Run `write` while holding the write lock for `key`, so cache updates
    /// for one key happen in the order their backend writes committed.
    async fn serialized<F, R>(&self, key: &CacheKey<K>, write: F) -> Result<R, StorageError>
    where
        F: Future<Output = Result<R, StorageError>>,
    {
        let lock = self.write_locks.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            write.await
        };
        drop(lock);
        self.write_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }
}

/// Cache bookkeeping for one backend write. Unless committed, dropping it
/// invalidates the key: a write that failed or was cancelled may still have
/// reached the backend, so the previous cached value can no longer be served.
struct PendingWrite<'a, K: Key> {
    cache: &'a ReadThroughCache<CacheKey<K>, Json>,
    key: &'a CacheKey<K>,
    armed: bool,
}

impl<'a, K: Key> PendingWrite<'a, K> {
    fn new(cache: &'a ReadThroughCache<CacheKey<K>, Json>, key: &'a CacheKey<K>) -> Self {
        Self {
            cache,
            key,
            armed: true,
        }
    }

    fn commit(mut self, document: Json, ttl: Duration) {
        self.armed = false;
        self.cache.set(self.key.clone(), document, Some(ttl));
    }
}

impl<K: Key> Drop for PendingWrite<'_, K> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.invalidate(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Aggregate, PageSlice, Path, QueryPlan, QuerySession};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, crate::Document)]
    #[document(collection = "notes")]
    struct Note {
        #[key]
        id: String,
        body: String,
    }

    #[derive(Default)]
    struct CountingBackend {
        documents: std::sync::Mutex<HashMap<String, Json>>,
        loads: AtomicUsize,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl DocumentBackend for CountingBackend {
        async fn load(&self, _collection: &str, id: &str) -> Result<Option<Json>, StorageError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.documents.lock().unwrap().get(id).cloned())
        }

        async fn store(&self, _collection: &str, id: &str, document: Json) -> Result<(), StorageError> {
            self.documents.lock().unwrap().insert(id.to_string(), document);
            Ok(())
        }

        async fn delete(&self, _collection: &str, id: &str) -> Result<(), StorageError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.documents.lock().unwrap().remove(id);
            Ok(())
        }

        async fn open_query(&self, _collection: &str) -> Result<Box<dyn QuerySession>, StorageError> {
            Ok(Box::new(NoQueries))
        }
    }

    struct NoQueries;

    #[async_trait]
    impl QuerySession for NoQueries {
        async fn fetch(&mut self, _plan: &QueryPlan) -> Result<Vec<Json>, StorageError> {
            Err(StorageError::Unsupported("fetch".into()))
        }

        async fn count(&mut self, _plan: &QueryPlan) -> Result<u64, StorageError> {
            Ok(u64::MAX)
        }

        async fn aggregate(
            &mut self,
            _plan: &QueryPlan,
            _aggregate: Aggregate,
            _field: &Path,
        ) -> Result<Option<Json>, StorageError> {
            Err(StorageError::Unsupported("aggregate".into()))
        }

        async fn fetch_page(
            &mut self,
            _plan: &QueryPlan,
            _offset: u64,
            _limit: u64,
        ) -> Result<PageSlice, StorageError> {
            Err(StorageError::Unsupported("fetch_page".into()))
        }

        async fn close(self: Box<Self>) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn note(id: &str, body: &str) -> Note {
        Note {
            id: id.to_string(),
            body: body.to_string(),
        }
    }

    fn store_over(backend: &Arc<CountingBackend>) -> StringDataStore {
        DataStore::new(Arc::clone(backend) as Arc<dyn DocumentBackend>)
    }

    #[tokio::test]
    async fn test_stored_item_is_served_from_cache() {
        let backend = Arc::new(CountingBackend::default());
        let store = store_over(&backend);

        store.store_item(note("a", "hello"), None).await.unwrap();
        let fetched: Option<Note> = store.get_item(&"a".to_string(), None).await.unwrap();

        assert_eq!(fetched, Some(note("a", "hello")));
        assert_eq!(backend.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_uncached_store_always_loads() {
        let backend = Arc::new(CountingBackend::default());
        let store = DataStore::with_config(
            Arc::clone(&backend) as Arc<dyn DocumentBackend>,
            RandomStringKeys,
            StoreConfig::uncached(),
        );
        assert!(!store.supports_caching());

        store.store_item(note("a", "hello"), None).await.unwrap();
        let _: Option<Note> = store.get_item(&"a".to_string(), None).await.unwrap();
        let _: Option<Note> = store.get_item(&"a".to_string(), None).await.unwrap();
        assert_eq!(backend.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remove_invalidates_cache() {
        let backend = Arc::new(CountingBackend::default());
        let store = store_over(&backend);

        let item = store.store_item(note("a", "hello"), None).await.unwrap();
        assert!(store.remove_item(&item).await.unwrap());

        let fetched: Option<Note> = store.get_item(&"a".to_string(), None).await.unwrap();
        assert_eq!(fetched, None);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
        assert!(store.write_locks.is_empty());
    }

    #[tokio::test]
    async fn test_empty_id_short_circuits() {
        let backend = Arc::new(CountingBackend::default());
        let store = store_over(&backend);

        assert!(!store.remove_item_by_id::<Note>(&String::new()).await.unwrap());
        let fetched: Option<Note> = store.get_item(&String::new(), None).await.unwrap();
        assert_eq!(fetched, None);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 0);
        assert_eq!(backend.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_count_overflow_is_a_range_error() {
        let backend = Arc::new(CountingBackend::default());
        let store = store_over(&backend);

        let mut notes = store.query::<Note>().await.unwrap();
        match notes.count().await {
            Err(StorageError::Range { operator, .. }) => assert_eq!(operator, "count"),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(matches!(
            notes.long_count().await,
            Err(StorageError::Range { .. })
        ));
    }

    #[test]
    fn test_ids_and_keys() {
        let backend = Arc::new(CountingBackend::default());
        let mut store = store_over(&backend);

        let id = store.create_new_id::<Note>().unwrap();
        assert_eq!(id.len(), 36);
        assert_ne!(store.create_new_id_for_type("Note"), Some(id.clone()));
        assert_eq!(store.get_key(&note(&id, "x")), id);

        assert_eq!(store.default_cache_timeout(), Duration::from_secs(600));
        store.set_default_cache_timeout(Duration::from_secs(1));
        assert_eq!(store.default_cache_timeout(), Duration::from_secs(1));
    }
}
