//! Filesystem storage backend.
//!
//! Lays blobs out as `<root>/<collection>/<key>`. Keys are used as file
//! names verbatim, so they must not contain path separators; the backend
//! rejects such keys instead of creating surprise directories.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use crate::error::StorageError;

use super::Storage;

/// Directory-per-collection, file-per-key blob store.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Creates a backend rooted at `root`. The directory is created lazily
    /// on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, collection: &str, key: &str) -> Result<PathBuf, StorageError> {
        for part in [collection, key] {
            if part.is_empty() || part.contains(['/', '\\']) || part == "." || part == ".." {
                return Err(StorageError::Backend {
                    reason: format!("invalid storage key '{part}'"),
                });
            }
        }
        Ok(self.root.join(collection).join(key))
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn get(&self, collection: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.blob_path(collection, key)?;
        match fs::read(&path).await {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, collection: &str, key: &str, blob: &[u8]) -> Result<(), StorageError> {
        let path = self.blob_path(collection, key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        // Write-then-rename so readers never observe a half-written blob.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, blob).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.root.join(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.ends_with(".tmp") {
                        keys.push(name.to_string());
                    }
                }
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }
}
