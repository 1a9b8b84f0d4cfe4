//! Document Storage - backend-agnostic persistence for keyed documents.
//!
//! This crate provides a data store façade over pluggable storage engines,
//! with composable lazily evaluated queries, paging and a read-through cache
//! for keyed lookups.
//!
//! # Core Concepts
//!
//! - **Document**: a serializable type with a key and a collection name.
//! - **Query plan**: an immutable chain of operators (filter, select, order,
//!   skip, take, ...) that an engine translates and executes only when a
//!   materializing operation is called.
//! - **Read-through cache**: keyed reads are served from memory until the
//!   entry expires; writes through the store keep it current.
//!
//! # Types
//!
//! - [`DataStore`]: the façade applications use
//! - [`QueryableSequence`] / [`OrderedQueryableSequence`]: lazy queries
//! - [`PagedResult`]: one materialized page of a result
//! - [`ReadThroughCache`]: the keyed-read cache
//! - [`DocumentBackend`] / [`QuerySession`]: what an engine implements

#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::unwrap_in_result,
        clippy::panic
    )
)]

// Lets the derive macro's `::document_storage` paths resolve inside this crate.
extern crate self as document_storage;

mod backend;
mod cache;
mod config;
mod connection;
mod document;
mod error;
mod paged;
mod query;
mod sequence;
mod store;

pub use backend::{DocumentBackend, QuerySession};
pub use cache::{CacheConfig, ReadThroughCache};
pub use config::{DEFAULT_CACHE_TIMEOUT, StoreConfig};
pub use connection::{ConnectionConfig, RepositoryConnection};
pub use document::{Document, Key, KeyGenerator, RandomStringKeys, RandomUuidKeys};
pub use error::{BackendError, StorageError};
pub use paged::{PageSlice, PagedResult};
pub use query::{
    Aggregate, Combiner, Comparer, Equality, Filter, IndexedMapper, IndexedPredicate, Mapper,
    Operation, Order, Path, Predicate, Projection, QueryPlan, SortKey, Value,
};
pub use sequence::{OrderedQueryableSequence, QueryableSequence};
pub use store::{DataStore, StringDataStore};

// Re-export derive macro
pub use document_storage_derive::Document;
