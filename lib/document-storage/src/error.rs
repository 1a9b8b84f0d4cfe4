use thiserror::Error;

/// Boxed error raised by a storage engine, propagated without modification.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cannot translate '{operator}': {reason}")]
    Translation {
        operator: &'static str,
        reason: String,
    },

    #[error("Custom comparer is not supported for '{operator}' by this engine")]
    UnsupportedComparer { operator: &'static str },

    #[error("Operation unsupported: {0}")]
    Unsupported(String),

    #[error("Cardinality violation in '{operator}': {reason}")]
    Cardinality {
        operator: &'static str,
        reason: String,
    },

    #[error("Count {count} returned by '{operator}' exceeds {limit}")]
    Range {
        operator: &'static str,
        count: u64,
        limit: u64,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(#[source] BackendError),
}

impl StorageError {
    /// Wrap an engine error, keeping it as the error source.
    pub fn backend(err: impl Into<BackendError>) -> Self {
        StorageError::Backend(err.into())
    }

    /// Shorthand for a [`StorageError::Translation`].
    pub fn translation(operator: &'static str, reason: impl Into<String>) -> Self {
        StorageError::Translation {
            operator,
            reason: reason.into(),
        }
    }
}
