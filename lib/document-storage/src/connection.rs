//! Connection lifecycle for engines backed by a database server.

use async_trait::async_trait;

use crate::StorageError;

/// Where a server-backed engine connects, and how large its pool may grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub url: String,
    /// Upper bound on pooled connections; `None` keeps the engine's default.
    /// Each open query sequence holds one connection until released.
    pub max_connections: Option<u32>,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: None,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max);
        self
    }
}

impl From<&str> for ConnectionConfig {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for ConnectionConfig {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

impl From<&String> for ConnectionConfig {
    fn from(url: &String) -> Self {
        Self::new(url.as_str())
    }
}

/// Opening and preparing a server-backed engine.
#[async_trait]
pub trait RepositoryConnection: Sized + Send + Sync {
    async fn connect(config: impl Into<ConnectionConfig> + Send) -> Result<Self, StorageError>;

    /// Create the documents table if missing. Safe to run on every start.
    async fn initialize(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_conversions_keep_default_pool() {
        let config: ConnectionConfig = "postgres://localhost/docs".into();
        assert_eq!(config.url, "postgres://localhost/docs");
        assert_eq!(config.max_connections, None);

        let owned = String::from("postgres://db/docs");
        assert_eq!(ConnectionConfig::from(&owned), ConnectionConfig::from(owned.clone()));
    }

    #[test]
    fn test_max_connections_builder() {
        let config = ConnectionConfig::new("postgres://db/docs").with_max_connections(4);
        assert_eq!(config.max_connections, Some(4));
    }
}
