//! PostgreSQL implementation for document-storage.
//!
//! Every collection shares a single `documents (collection, id, data jsonb)`
//! table. Query plans are translated to nested SQL selects over `jsonb`
//! paths; custom predicates, projections, combiners and comparers cannot be
//! expressed in SQL and fail with [`StorageError::Translation`] or
//! [`StorageError::UnsupportedComparer`] when the query first executes.
//!
//! # Usage
//!
//! ```text
//! use document_storage::{DataStore, RepositoryConnection};
//! use document_storage_postgres::PgBackend;
//!
//! let backend = PgBackend::connect("postgres://localhost/documents").await?;
//! backend.initialize().await?;
//! let store = DataStore::new(Arc::new(backend));
//! ```

#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::unwrap_in_result,
        clippy::panic
    )
)]

mod backend;
mod translate;

pub use backend::PgBackend;

// Re-export core types for convenience
pub use document_storage::{ConnectionConfig, RepositoryConnection, StorageError};
