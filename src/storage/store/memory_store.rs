//! An in-memory store.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::storage::{MaybeBytes, ReadableStorageTraits, StorageError, StoreKey};

/// An in-memory store.
///
/// Primarily intended for testing and for embedding pre-materialised
/// hierarchies.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data_map: RwLock<HashMap<StoreKey, Bytes>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` at `key`.
    pub fn set(&self, key: &StoreKey, value: impl Into<Bytes>) {
        self.data_map.write().insert(key.clone(), value.into());
    }

    /// Remove the value at `key`, returning true if it existed.
    pub fn erase(&self, key: &StoreKey) -> bool {
        self.data_map.write().remove(key).is_some()
    }
}

#[async_trait::async_trait]
impl ReadableStorageTraits for MemoryStore {
    async fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        Ok(self.data_map.read().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_get_set_erase() {
        let store = MemoryStore::new();
        let key = StoreKey::new("a/b").unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
        store.set(&key, vec![0u8, 1, 2]);
        assert_eq!(store.get(&key).await.unwrap().unwrap().as_ref(), &[0, 1, 2]);
        assert!(store.erase(&key));
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
