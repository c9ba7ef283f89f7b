//! Object storage for backups.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageError;

/// Where backup dumps are uploaded.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `key` and returns the object's location.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError>;

    /// Fetches the object at `location`.
    async fn get(&self, location: &str) -> Result<Vec<u8>, StorageError>;

    /// Deletes the object at `location`. Missing objects are not an error.
    async fn delete(&self, location: &str) -> Result<(), StorageError>;
}

/// Directory-backed object store.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Creates a store rooted at `root`; the directory is created on first
    /// write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn io(location: &Path, source: std::io::Error) -> StorageError {
        if source.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(location.display().to_string())
        } else {
            StorageError::Io {
                location: location.display().to_string(),
                source,
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        if key.contains('/') || key.contains('\\') || key.starts_with('.') {
            return Err(StorageError::Unavailable(format!("Invalid object key '{key}'")));
        }
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Self::io(&self.root, e))?;
        let path = self.root.join(key);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| Self::io(&path, e))?;
        debug!(location = %path.display(), size = bytes.len(), "Stored object");
        Ok(path.display().to_string())
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        let path = Path::new(location);
        tokio::fs::read(path).await.map_err(|e| Self::io(path, e))
    }

    async fn delete(&self, location: &str) -> Result<(), StorageError> {
        let path = Path::new(location);
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io(path, e)),
        }
    }
}
