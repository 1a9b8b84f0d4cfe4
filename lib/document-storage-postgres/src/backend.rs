//! PostgreSQL implementation of the document backend.

const DEFAULT_MAX_CONNECTIONS: u32 = 16;

use async_trait::async_trait;
use document_storage::{
    Aggregate, ConnectionConfig, DocumentBackend, PageSlice, Path, QueryPlan, QuerySession,
    RepositoryConnection, StorageError,
};
use serde_json::Value as Json;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, trace};

use crate::translate::{self, Statement};

/// Document engine storing every collection in one `documents` table.
#[derive(Clone, Debug)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Create a backend from an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the inner sqlx pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RepositoryConnection for PgBackend {
    async fn connect(config: impl Into<ConnectionConfig> + Send) -> Result<Self, StorageError> {
        let config: ConnectionConfig = config.into();
        let max_connections = config.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        debug!(max_connections, "connecting to postgres");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(&config.url)
            .await
            .map_err(StorageError::backend)?;
        Ok(Self::new(pool))
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        debug!("creating documents table");
        sqlx::query(translate::SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StorageError::backend)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentBackend for PgBackend {
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Json>, StorageError> {
        trace!(collection, id, "loading document");
        let row = sqlx::query(translate::LOAD)
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::backend)?;
        row.map(|row| row.try_get::<Json, _>(0))
            .transpose()
            .map_err(StorageError::backend)
    }

    async fn store(&self, collection: &str, id: &str, document: Json) -> Result<(), StorageError> {
        trace!(collection, id, "storing document");
        let mut tx = self.pool.begin().await.map_err(StorageError::backend)?;
        sqlx::query(translate::UPSERT)
            .bind(collection)
            .bind(id)
            .bind(document)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::backend)?;
        tx.commit().await.map_err(StorageError::backend)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        trace!(collection, id, "deleting document");
        sqlx::query(translate::DELETE)
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StorageError::backend)?;
        Ok(())
    }

    async fn open_query(&self, collection: &str) -> Result<Box<dyn QuerySession>, StorageError> {
        let connection = self.pool.acquire().await.map_err(StorageError::backend)?;
        debug!(collection, "opened postgres query session");
        Ok(Box::new(PgSession {
            connection,
            collection: collection.to_string(),
        }))
    }
}

/// A query session holding one pooled connection until dropped or closed.
struct PgSession {
    connection: PoolConnection<Postgres>,
    collection: String,
}

impl PgSession {
    async fn rows(&mut self, statement: Statement) -> Result<Vec<sqlx::postgres::PgRow>, StorageError> {
        trace!(collection = %self.collection, sql = %statement.sql, "executing query");
        let args = statement.arguments()?;
        sqlx::query_with(&statement.sql, args)
            .fetch_all(&mut *self.connection)
            .await
            .map_err(StorageError::backend)
    }

    async fn scalar_count(&mut self, statement: Statement) -> Result<u64, StorageError> {
        let rows = self.rows(statement).await?;
        let count: i64 = match rows.first() {
            Some(row) => row.try_get(0).map_err(StorageError::backend)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl QuerySession for PgSession {
    async fn fetch(&mut self, plan: &QueryPlan) -> Result<Vec<Json>, StorageError> {
        let statement = translate::fetch(&self.collection, &plan.operations()?)?;
        self.rows(statement)
            .await?
            .iter()
            .map(|row| row.try_get::<Json, _>(0).map_err(StorageError::backend))
            .collect()
    }

    async fn count(&mut self, plan: &QueryPlan) -> Result<u64, StorageError> {
        let statement = translate::count(&self.collection, &plan.operations()?)?;
        self.scalar_count(statement).await
    }

    async fn aggregate(
        &mut self,
        plan: &QueryPlan,
        aggregate: Aggregate,
        field: &Path,
    ) -> Result<Option<Json>, StorageError> {
        let statement =
            translate::aggregate(&self.collection, &plan.operations()?, aggregate, field)?;
        let rows = self.rows(statement).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        match aggregate {
            Aggregate::Sum | Aggregate::Average => {
                let text: Option<String> = row.try_get(0).map_err(StorageError::backend)?;
                text.map(|text| serde_json::from_str(&text))
                    .transpose()
                    .map_err(StorageError::from)
            }
            Aggregate::Max | Aggregate::Min => {
                row.try_get::<Option<Json>, _>(0).map_err(StorageError::backend)
            }
        }
    }

    async fn fetch_page(
        &mut self,
        plan: &QueryPlan,
        offset: u64,
        limit: u64,
    ) -> Result<PageSlice, StorageError> {
        let operations = plan.operations()?;
        let statement = translate::page(&self.collection, &operations, offset, limit)?;
        let rows = self.rows(statement).await?;

        let mut items = Vec::with_capacity(rows.len());
        let mut total = None;
        for row in &rows {
            items.push(row.try_get::<Json, _>("doc").map_err(StorageError::backend)?);
            let count: i64 = row.try_get("total").map_err(StorageError::backend)?;
            total = Some(u64::try_from(count).unwrap_or(0));
        }

        // An empty page carries no window row to read the total from.
        if total.is_none() {
            let statement = translate::count(&self.collection, &operations)?;
            total = Some(self.scalar_count(statement).await?);
        }

        Ok(PageSlice {
            items,
            total_count: total,
        })
    }

    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        debug!(collection = %self.collection, "closing postgres query session");
        drop(self.connection);
        Ok(())
    }
}
