//! # Storage abstraction consumed by the node.
//!
//! The node reads manifests, app bundles, and runlists through the
//! [`Storage`] trait and never touches a backend directly. Collections in
//! use:
//!
//! | Collection  | Contents                                   |
//! |-------------|--------------------------------------------|
//! | `manifests` | JSON manifest documents, one per app       |
//! | `apps`      | gzipped tarballs of app code               |
//! | `runlists`  | JSON maps of `app name → profile name`     |
//!
//! Two implementations ship with the crate:
//! - [`MemoryStorage`] - concurrent in-process map; tests and caches.
//! - [`FsStorage`] - directory-per-collection, file-per-key; the local
//!   manifest cache.
//!
//! Calls from one engine must not block another; implementations are async
//! end-to-end.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;

use crate::error::StorageError;

/// Frame-agnostic blob store keyed by `(collection, key)`.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Reads the blob stored under `(collection, key)`.
    ///
    /// Returns [`StorageError::NotFound`] if the key does not exist.
    async fn get(&self, collection: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Stores a blob under `(collection, key)`, replacing any previous
    /// value.
    async fn put(&self, collection: &str, key: &str, blob: &[u8]) -> Result<(), StorageError>;

    /// Lists the keys of a collection. An absent collection is an empty
    /// one.
    async fn list(&self, collection: &str) -> Result<Vec<String>, StorageError>;
}
