//! Bounded async caches with single-flight loading.
//!
//! Concurrent misses on one key coalesce into a single load: every caller
//! awaits the same cell and the loader runs once. Failed loads are not
//! cached, so a later caller retries. Entries evicted while a load is in
//! flight are harmless; the load completes and its result is discarded with
//! the cell.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OnceCell};

use crate::array::ZarrArray;

/// A cache key scoping a node path to one hierarchy root.
pub type NodeKey = (String, String);

/// The shared root-attributes cache: `(root id, path)` to attributes.
pub type MetadataCache = Cache<NodeKey, Arc<Map<String, Value>>>;

/// The shared open-array cache: `(root id, path)` to array.
pub type ArrayCache = Cache<NodeKey, Arc<ZarrArray>>;

/// A bounded LRU cache of single-flight cells.
pub struct Cache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, Arc<OnceCell<V>>>>,
}

impl<K: Hash + Eq, V> std::fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Cache<K, V> {
    /// Create a new cache bounded to `capacity` entries (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Get the value at `key`, running `load` on a miss.
    ///
    /// Concurrent callers for one key share a single `load` invocation and
    /// all receive its value. A failed load leaves the entry empty.
    ///
    /// # Errors
    ///
    /// Returns the error of this caller's `load` if it ran and failed.
    pub async fn get_or_try_load<E, F, Fut>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries
                .get_or_insert(key, || Arc::new(OnceCell::new()))
                .clone()
        };
        // The lock is released before awaiting the load; only callers of
        // this key wait on the cell.
        cell.get_or_try_init(load).await.map(Clone::clone)
    }

    /// Whether `key` holds a loaded value, without promoting it.
    pub async fn contains_loaded(&self, key: &K) -> bool {
        self.entries
            .lock()
            .await
            .peek(key)
            .is_some_and(|cell| cell.initialized())
    }

    /// Drop every entry.
    pub async fn invalidate_all(&self) {
        self.entries.lock().await.clear();
    }

    /// The number of entries, loaded or in flight.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
