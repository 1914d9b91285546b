//! Durable client storage for the serialized session blob.
//!
//! Storage holds exactly one opaque string per namespace. The credential
//! store decides what goes in it; implementations only move bytes.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::SyncError;

/// Default namespace the session blob is stored under.
pub const DEFAULT_NAMESPACE: &str = "brain-heist-auth";

/// Durable key/value storage for the session blob.
#[async_trait]
pub trait SessionStorage: Send + Sync + 'static {
    /// Read the blob stored under `namespace`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the medium cannot be read.
    async fn load(&self, namespace: &str) -> Result<Option<String>, SyncError>;

    /// Replace the blob stored under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the medium cannot be written.
    async fn save(&self, namespace: &str, blob: &str) -> Result<(), SyncError>;

    /// Remove the blob stored under `namespace`. Removing a missing blob is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the medium cannot be written.
    async fn clear(&self, namespace: &str) -> Result<(), SyncError>;
}

/// Process-local storage, for tests and hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob, as if persisted by an earlier run.
    pub fn with_blob(namespace: impl Into<String>, blob: impl Into<String>) -> Self {
        let storage = Self::default();
        storage
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.into(), blob.into());
        storage
    }

    /// Current blob under `namespace`, without going through the async API.
    pub fn snapshot(&self, namespace: &str) -> Option<String> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn load(&self, namespace: &str) -> Result<Option<String>, SyncError> {
        Ok(self.snapshot(namespace))
    }

    async fn save(&self, namespace: &str, blob: &str) -> Result<(), SyncError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.to_string(), blob.to_string());
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> Result<(), SyncError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace);
        Ok(())
    }
}

/// File-per-namespace storage under a directory.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash mid-write leaves the previous blob intact.
#[cfg(feature = "file-storage")]
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: std::path::PathBuf,
}

#[cfg(feature = "file-storage")]
impl FileStorage {
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, namespace: &str) -> std::path::PathBuf {
        let file: String = namespace
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

#[cfg(feature = "file-storage")]
#[async_trait]
impl SessionStorage for FileStorage {
    async fn load(&self, namespace: &str) -> Result<Option<String>, SyncError> {
        match tokio::fs::read_to_string(self.path(namespace)).await {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, namespace: &str, blob: &str) -> Result<(), SyncError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(namespace);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, blob).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> Result<(), SyncError> {
        match tokio::fs::remove_file(self.path(namespace)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_save_load_clear() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.load(DEFAULT_NAMESPACE).await.unwrap(), None);

        storage.save(DEFAULT_NAMESPACE, "{}").await.unwrap();
        assert_eq!(
            storage.load(DEFAULT_NAMESPACE).await.unwrap().as_deref(),
            Some("{}")
        );

        storage.clear(DEFAULT_NAMESPACE).await.unwrap();
        storage.clear(DEFAULT_NAMESPACE).await.unwrap();
        assert_eq!(storage.load(DEFAULT_NAMESPACE).await.unwrap(), None);
    }

    #[cfg(feature = "file-storage")]
    #[tokio::test]
    async fn file_storage_round_trips_and_tolerates_missing() {
        let dir = std::env::temp_dir().join(format!("heist-sync-{}", uuid::Uuid::new_v4()));
        let storage = FileStorage::new(&dir);

        assert_eq!(storage.load("brain-heist-auth").await.unwrap(), None);
        storage.clear("brain-heist-auth").await.unwrap();

        storage.save("brain-heist-auth", "blob-1").await.unwrap();
        storage.save("brain-heist-auth", "blob-2").await.unwrap();
        assert_eq!(
            storage.load("brain-heist-auth").await.unwrap().as_deref(),
            Some("blob-2")
        );

        storage.clear("brain-heist-auth").await.unwrap();
        assert_eq!(storage.load("brain-heist-auth").await.unwrap(), None);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[cfg(feature = "file-storage")]
    #[test]
    fn namespace_is_sanitized_into_file_name() {
        let storage = FileStorage::new("/tmp/x");
        assert!(storage.path("../evil/ns").ends_with("___evil_ns.json"));
    }
}
