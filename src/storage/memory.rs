//! In-process storage backend over a concurrent map.
//!
//! Used as the cache tier and throughout the test-suite. Collections are
//! created implicitly on first `put`.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StorageError;

use super::Storage;

/// Concurrent in-memory blob store.
///
/// Cloning is cheap-ish but not intended; share it behind an `Arc` like any
/// other backend.
#[derive(Default)]
pub struct MemoryStorage {
    collections: DashMap<String, DashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletes a blob. Deletion is not part of the [`Storage`] contract
    /// the node consumes; this exists for cache invalidation and tests.
    pub fn remove(&self, collection: &str, key: &str) {
        if let Some(c) = self.collections.get(collection) {
            c.remove(key);
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, collection: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.collections
            .get(collection)
            .and_then(|c| c.get(key).map(|v| v.clone()))
            .ok_or_else(|| StorageError::NotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            })
    }

    async fn put(&self, collection: &str, key: &str, blob: &[u8]) -> Result<(), StorageError> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = match self.collections.get(collection) {
            Some(c) => c.iter().map(|e| e.key().clone()).collect(),
            None => Vec::new(),
        };
        keys.sort_unstable();
        Ok(keys)
    }
}
