//! Bounded in-memory cache.
//!
//! Uses moka's concurrent cache with an LRU eviction policy so that the
//! oldest untouched entries are the ones dropped when capacity is exceeded.

use std::{fmt::Debug, hash::Hash, time::Duration};

use moka::{notification::RemovalCause, policy::EvictionPolicy, sync::Cache};
use tracing::debug;

/// Thread-safe in-memory cache with a capacity bound and optional idle expiry.
#[derive(Clone)]
pub struct MemCache<K, V> {
    entries: Cache<K, V>,
}

impl<K, V> MemCache<K, V>
where
    K: Hash + Eq + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Allocate a new [`MemCache`].
    ///
    /// Entries idle longer than `time_to_idle` expire; `None` disables expiry.
    pub fn new(
        capacity: u64,
        time_to_idle: Option<Duration>,
    ) -> Self {
        let mut builder = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(|key: std::sync::Arc<K>, _value: V, cause: RemovalCause| {
                if cause.was_evicted() {
                    debug!("cache entry {:?} evicted ({:?})", key, cause);
                }
            });
        if let Some(idle) = time_to_idle {
            builder = builder.time_to_idle(idle);
        }

        Self {
            entries: builder.build(),
        }
    }

    pub fn set(
        &self,
        key: K,
        value: V,
    ) {
        self.entries.insert(key, value);
    }

    pub fn get(
        &self,
        key: &K,
    ) -> Option<V> {
        self.entries.get(key)
    }

    pub fn contains(
        &self,
        key: &K,
    ) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(
        &self,
        key: &K,
    ) -> Option<V> {
        self.entries.remove(key)
    }

    /// Approximate number of live entries; exact after [`MemCache::sync`].
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Applies pending evictions and expirations.
    pub fn sync(&self) {
        self.entries.run_pending_tasks();
    }
}
