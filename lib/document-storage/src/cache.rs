//! Read-through cache for keyed lookups.
//!
//! Entries carry an absolute expiration and a write stamp. Stamps come from
//! a single monotonic counter, so a load that started before a later
//! [`set`](ReadThroughCache::set) or invalidation can never overwrite it,
//! regardless of which finishes first. Concurrent misses for one key share
//! a single load, and a write detaches the shared load so readers arriving
//! after it never join a load that began before it.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::sync::OnceCell;
use tracing::trace;

/// Configuration for the read-through cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries before the oldest-expiring are evicted.
    pub max_entries: usize,
    /// TTL used when a caller does not supply one.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl: Duration::from_secs(600),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the max entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Set the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

#[derive(Debug)]
struct Entry<V> {
    /// `None` marks a removal that in-flight loads must not undo.
    value: Option<V>,
    stamp: u64,
    expires_at: DateTime<Utc>,
}

type Inflight<V> = Arc<OnceCell<Option<V>>>;

/// A concurrency-safe, time-bounded cache mediating single-item reads.
pub struct ReadThroughCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    inflight: DashMap<K, Inflight<V>>,
    clock: AtomicU64,
    /// Newest stamp of any entry dropped by expiry or eviction. A load that
    /// began before it may not fill a vacant slot.
    dropped: AtomicU64,
    config: CacheConfig,
}

impl<K, V> ReadThroughCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Create a new read-through cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            clock: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            config,
        }
    }

    /// Create a new read-through cache with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Get the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of entries currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the live entry for `key`, or run `loader` and cache a found value.
    ///
    /// A `None` from the loader is returned but not cached. Loader errors are
    /// returned unchanged and leave the cache untouched.
    pub async fn get_or_load<F, Fut, E>(
        &self,
        key: K,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        if let Some(value) = self.live(&key) {
            trace!(?key, "cache hit");
            return Ok(Some(value));
        }

        let started = self.tick();
        let cell = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let _guard = InflightGuard {
            inflight: &self.inflight,
            key: &key,
            cell: &cell,
        };

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let value = cell
            .get_or_try_init(|| async {
                trace!(?key, "cache miss, loading");
                let loaded = loader().await?;
                if let Some(value) = &loaded {
                    self.insert_loaded(key.clone(), value.clone(), started, ttl);
                }
                Ok::<_, E>(loaded)
            })
            .await?;
        Ok(value.clone())
    }

    /// Cache `value` for `key`, replacing any entry. Used after writes.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let entry = Entry {
            value: Some(value),
            stamp: self.tick(),
            expires_at: expires_at(ttl),
        };
        self.entries.insert(key.clone(), entry);
        self.inflight.remove(&key);
        self.evict_if_needed();
    }

    /// Forget `key`. Loads already in flight will neither repopulate it nor
    /// be joined by later readers.
    pub fn invalidate(&self, key: &K) {
        let entry = Entry {
            value: None,
            stamp: self.tick(),
            expires_at: expires_at(self.config.default_ttl),
        };
        self.entries.insert(key.clone(), entry);
        self.inflight.remove(key);
        self.evict_if_needed();
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn live(&self, key: &K) -> Option<V> {
        let now = Utc::now();
        {
            let entry = self.entries.get(key)?;
            if entry.expires_at > now {
                return entry.value.clone();
            }
        }
        if let Some((_, entry)) = self.entries.remove_if(key, |_, entry| entry.expires_at <= now) {
            self.dropped.fetch_max(entry.stamp, Ordering::SeqCst);
        }
        None
    }

    fn insert_loaded(&self, key: K, value: V, started: u64, ttl: Duration) {
        let entry = Entry {
            value: Some(value),
            stamp: self.tick(),
            expires_at: expires_at(ttl),
        };
        match self.entries.entry(key) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().stamp < started {
                    occupied.insert(entry);
                } else {
                    trace!(key = ?occupied.key(), "discarding load superseded by a newer write");
                }
            }
            MapEntry::Vacant(vacant) => {
                if self.dropped.load(Ordering::SeqCst) < started {
                    vacant.insert(entry);
                } else {
                    trace!(key = ?vacant.key(), "discarding load that predates a dropped entry");
                }
            }
        }
        self.evict_if_needed();
    }

    /// Once over capacity, shrink to the low-water mark (90% of capacity) so
    /// the scan runs once per batch of writes rather than on every write.
    fn evict_if_needed(&self) {
        let capacity = self.config.max_entries;
        if self.entries.len() <= capacity {
            return;
        }
        let low_water = capacity - capacity / 10;
        let now = Utc::now();
        let mut newest_dropped: u64 = 0;
        self.entries.retain(|_, entry| {
            let live = entry.expires_at > now;
            if !live {
                newest_dropped = newest_dropped.max(entry.stamp);
            }
            live
        });

        let excess = self.entries.len().saturating_sub(low_water);
        if excess > 0 {
            let mut by_expiry: Vec<(K, DateTime<Utc>)> = self
                .entries
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().expires_at))
                .collect();
            by_expiry.select_nth_unstable_by_key(excess - 1, |(_, expires)| *expires);
            for (key, _) in by_expiry.into_iter().take(excess) {
                if let Some((_, entry)) = self.entries.remove(&key) {
                    newest_dropped = newest_dropped.max(entry.stamp);
                }
            }
            trace!(evicted = excess, "cache over capacity");
        }
        self.dropped.fetch_max(newest_dropped, Ordering::SeqCst);
    }
}

/// Drops the shared in-flight cell once a caller is done with it, including
/// when the caller's future is cancelled.
struct InflightGuard<'a, K: Eq + Hash, V> {
    inflight: &'a DashMap<K, Inflight<V>>,
    key: &'a K,
    cell: &'a Inflight<V>,
}

impl<K: Eq + Hash, V> Drop for InflightGuard<'_, K, V> {
    fn drop(&mut self) {
        self.inflight
            .remove_if(self.key, |_, cell| Arc::ptr_eq(cell, self.cell));
    }
}

fn expires_at(ttl: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
