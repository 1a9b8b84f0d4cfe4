//! Capability traits a storage engine implements.
//!
//! The query and cache layers only ever talk to these traits, so engines
//! (in-process, PostgreSQL, ...) are interchangeable.

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::{Aggregate, PageSlice, Path, QueryPlan, StorageError};

/// Primitive document operations. Each call is its own transactional unit.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Load a document by id. Absent documents are `Ok(None)`.
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Json>, StorageError>;

    /// Insert or replace a document and commit.
    async fn store(&self, collection: &str, id: &str, document: Json) -> Result<(), StorageError>;

    /// Delete a document and commit. Deleting an absent document succeeds.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError>;

    /// Open a read session for querying one collection.
    async fn open_query(&self, collection: &str) -> Result<Box<dyn QuerySession>, StorageError>;
}

/// A read session executing query plans.
///
/// A session is exclusively owned by one query sequence and is released
/// when dropped or closed. Engines that cannot express part of a plan must
/// fail with [`StorageError::Translation`], [`StorageError::UnsupportedComparer`]
/// or [`StorageError::Unsupported`] rather than run something different.
#[async_trait]
pub trait QuerySession: Send {
    /// Execute the plan and return its elements in order.
    async fn fetch(&mut self, plan: &QueryPlan) -> Result<Vec<Json>, StorageError>;

    /// Count the elements the plan produces.
    async fn count(&mut self, plan: &QueryPlan) -> Result<u64, StorageError>;

    /// Aggregate the value at `field` over the plan's elements, ignoring
    /// missing and null values. `None` when there is nothing to aggregate.
    async fn aggregate(
        &mut self,
        plan: &QueryPlan,
        aggregate: Aggregate,
        field: &Path,
    ) -> Result<Option<Json>, StorageError>;

    /// Return at most `limit` elements starting at `offset`, with the total
    /// element count when it is cheap to obtain.
    async fn fetch_page(
        &mut self,
        plan: &QueryPlan,
        offset: u64,
        limit: u64,
    ) -> Result<PageSlice, StorageError>;

    /// Release the session.
    async fn close(self: Box<Self>) -> Result<(), StorageError>;
}
