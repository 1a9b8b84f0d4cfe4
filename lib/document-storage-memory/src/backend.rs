use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use document_storage::{
    Aggregate, DocumentBackend, PageSlice, Path, QueryPlan, QuerySession, StorageError,
};
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::eval;

/// Snapshot of the round trips a [`MemoryBackend`] has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub loads: u64,
    pub stores: u64,
    pub deletes: u64,
    pub sessions_opened: u64,
    /// Sessions opened and not yet closed or dropped.
    pub open_sessions: u64,
    /// Query executions (fetch, count, aggregate, page).
    pub executions: u64,
}

impl BackendStats {
    /// Total primitive document calls (load, store, delete).
    pub fn document_calls(&self) -> u64 {
        self.loads + self.stores + self.deletes
    }
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicU64,
    stores: AtomicU64,
    deletes: AtomicU64,
    sessions_opened: AtomicU64,
    open_sessions: AtomicU64,
    executions: AtomicU64,
}

type Collections = HashMap<String, BTreeMap<String, Json>>;

#[derive(Debug, Default)]
struct Shared {
    collections: RwLock<Collections>,
    counters: Counters,
    latency: Option<Duration>,
}

impl Shared {
    async fn round_trip(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Documents of a collection in id order.
    async fn snapshot(&self, collection: &str) -> Vec<Json> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// An in-process document engine.
///
/// Documents live in memory, grouped by collection and ordered by id. Every
/// call counts towards [`BackendStats`], and an optional artificial latency
/// makes each round trip suspend so callers can exercise cancellation.
///
/// # Example
///
/// ```text
/// let backend = Arc::new(MemoryBackend::new());
/// let store = DataStore::new(backend.clone());
/// store.store_item(widget, None).await?;
/// assert_eq!(backend.stats().stores, 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose every round trip sleeps for `latency` first.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                latency: Some(latency),
                ..Shared::default()
            }),
        }
    }

    pub fn stats(&self) -> BackendStats {
        let counters = &self.shared.counters;
        BackendStats {
            loads: counters.loads.load(Ordering::SeqCst),
            stores: counters.stores.load(Ordering::SeqCst),
            deletes: counters.deletes.load(Ordering::SeqCst),
            sessions_opened: counters.sessions_opened.load(Ordering::SeqCst),
            open_sessions: counters.open_sessions.load(Ordering::SeqCst),
            executions: counters.executions.load(Ordering::SeqCst),
        }
    }

    /// Number of documents stored in `collection`.
    pub async fn len(&self, collection: &str) -> usize {
        let collections = self.shared.collections.read().await;
        collections.get(collection).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Json>, StorageError> {
        self.shared.counters.loads.fetch_add(1, Ordering::SeqCst);
        self.shared.round_trip().await;
        trace!(collection, id, "loading document");
        let collections = self.shared.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned())
    }

    async fn store(&self, collection: &str, id: &str, document: Json) -> Result<(), StorageError> {
        self.shared.counters.stores.fetch_add(1, Ordering::SeqCst);
        self.shared.round_trip().await;
        trace!(collection, id, "storing document");
        let mut collections = self.shared.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        self.shared.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.shared.round_trip().await;
        trace!(collection, id, "deleting document");
        let mut collections = self.shared.collections.write().await;
        if let Some(documents) = collections.get_mut(collection) {
            documents.remove(id);
        }
        Ok(())
    }

    async fn open_query(&self, collection: &str) -> Result<Box<dyn QuerySession>, StorageError> {
        let counters = &self.shared.counters;
        counters.sessions_opened.fetch_add(1, Ordering::SeqCst);
        counters.open_sessions.fetch_add(1, Ordering::SeqCst);
        debug!(collection, "opened memory query session");
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            collection: collection.to_string(),
        }))
    }
}

/// A query session reading the live contents of one collection.
struct MemorySession {
    shared: Arc<Shared>,
    collection: String,
}

impl MemorySession {
    async fn run(&self, plan: &QueryPlan) -> Result<Vec<Json>, StorageError> {
        let operations = plan.operations()?;
        self.shared
            .counters
            .executions
            .fetch_add(1, Ordering::SeqCst);
        self.shared.round_trip().await;
        trace!(collection = %self.collection, plan = %plan.describe(), "evaluating plan");
        let documents = self.shared.snapshot(&self.collection).await;
        eval::execute(documents, &operations)
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.shared
            .counters
            .open_sessions
            .fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl QuerySession for MemorySession {
    async fn fetch(&mut self, plan: &QueryPlan) -> Result<Vec<Json>, StorageError> {
        self.run(plan).await
    }

    async fn count(&mut self, plan: &QueryPlan) -> Result<u64, StorageError> {
        Ok(self.run(plan).await?.len() as u64)
    }

    async fn aggregate(
        &mut self,
        plan: &QueryPlan,
        aggregate: Aggregate,
        field: &Path,
    ) -> Result<Option<Json>, StorageError> {
        let documents = self.run(plan).await?;
        eval::aggregate(&documents, aggregate, field)
    }

    async fn fetch_page(
        &mut self,
        plan: &QueryPlan,
        offset: u64,
        limit: u64,
    ) -> Result<PageSlice, StorageError> {
        let documents = self.run(plan).await?;
        let total_count = documents.len() as u64;
        let items = documents
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect();
        Ok(PageSlice {
            items,
            total_count: Some(total_count),
        })
    }

    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        debug!(collection = %self.collection, "closing memory query session");
        Ok(())
    }
}
