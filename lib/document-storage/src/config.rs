//! Store configuration.

use std::time::Duration;

use crate::CacheConfig;

/// Default lifetime of cached items.
pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Configuration for a [`DataStore`](crate::DataStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether keyed reads go through the read-through cache.
    pub caching: bool,
    /// TTL applied when an operation does not supply one.
    pub default_cache_timeout: Duration,
    /// Capacity settings of the cache.
    pub cache: CacheConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            caching: true,
            default_cache_timeout: DEFAULT_CACHE_TIMEOUT,
            cache: CacheConfig::default().with_ttl(DEFAULT_CACHE_TIMEOUT),
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration whose store bypasses the cache entirely.
    pub fn uncached() -> Self {
        Self::default().with_caching(false)
    }

    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.caching = enabled;
        self
    }

    pub fn with_default_cache_timeout(mut self, timeout: Duration) -> Self {
        self.default_cache_timeout = timeout;
        self.cache.default_ttl = timeout;
        self
    }

    pub fn with_cache_capacity(mut self, max_entries: usize) -> Self {
        self.cache.max_entries = max_entries;
        self
    }
}
