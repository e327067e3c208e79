//! Object storage for uploaded bid files.
//!
//! References are opaque strings. [`FilesystemStorage`] hands out
//! content-addressed refs of the form `sha256/<2 hex>/<64 hex>.<ext>`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object reference: {0}")]
    InvalidRef(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn get_file(&self, file_ref: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `bytes` and return the reference to read them back.
    async fn put_file(&self, bytes: &[u8], extension: &str) -> Result<String, StorageError>;

    /// Delete every listed object. Missing objects are ignored.
    async fn delete_files(&self, file_refs: &[String]) -> Result<(), StorageError>;
}

fn content_ref(bytes: &[u8], extension: &str) -> String {
    let digest = hex(&Sha256::digest(bytes));
    let extension = extension
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    if extension.is_empty() {
        format!("sha256/{}/{digest}", &digest[..2])
    } else {
        format!("sha256/{}/{digest}.{extension}", &digest[..2])
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Relative refs only, no parent traversal.
fn checked_relative(file_ref: &str) -> Result<&Path, StorageError> {
    let path = Path::new(file_ref);
    let safe = !file_ref.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if safe {
        Ok(path)
    } else {
        Err(StorageError::InvalidRef(file_ref.to_string()))
    }
}

pub struct FilesystemStorage {
    base_path: PathBuf,
}

impl FilesystemStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn full_path(&self, file_ref: &str) -> Result<PathBuf, StorageError> {
        Ok(self.base_path.join(checked_relative(file_ref)?))
    }
}

#[async_trait]
impl ObjectStorage for FilesystemStorage {
    async fn get_file(&self, file_ref: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.full_path(file_ref)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(file_ref.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put_file(&self, bytes: &[u8], extension: &str) -> Result<String, StorageError> {
        let file_ref = content_ref(bytes, extension);
        let path = self.full_path(&file_ref)?;
        if fs::try_exists(&path).await? {
            debug!(file_ref = %file_ref, "object already stored");
            return Ok(file_ref);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &path).await.map_err(|err| {
            warn!(file_ref = %file_ref, error = %err, "rename into place failed");
            err
        })?;

        debug!(file_ref = %file_ref, size = bytes.len(), "object stored");
        Ok(file_ref)
    }

    async fn delete_files(&self, file_refs: &[String]) -> Result<(), StorageError> {
        for file_ref in file_refs {
            let path = self.full_path(file_ref)?;
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// Map-backed storage for tests and local runs.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes under a caller-chosen reference.
    pub async fn insert(&self, file_ref: &str, bytes: Vec<u8>) {
        self.objects.write().await.insert(file_ref.to_string(), bytes);
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn get_file(&self, file_ref: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(file_ref)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(file_ref.to_string()))
    }

    async fn put_file(&self, bytes: &[u8], extension: &str) -> Result<String, StorageError> {
        let file_ref = content_ref(bytes, extension);
        self.objects
            .write()
            .await
            .insert(file_ref.clone(), bytes.to_vec());
        Ok(file_ref)
    }

    async fn delete_files(&self, file_refs: &[String]) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        for file_ref in file_refs {
            objects.remove(file_ref);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filesystem_storage_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());

        let first = storage.put_file(b"bid sheet", ".PDF").await.unwrap();
        let second = storage.put_file(b"bid sheet", "pdf").await.unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("sha256/"));
        assert!(first.ends_with(".pdf"));
        assert_eq!(storage.get_file(&first).await.unwrap(), b"bid sheet");

        storage.delete_files(&[first.clone(), first.clone()]).await.unwrap();
        assert!(matches!(
            storage.get_file(&first).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn filesystem_storage_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());
        assert!(matches!(
            storage.get_file("../etc/passwd").await,
            Err(StorageError::InvalidRef(_))
        ));
        assert!(matches!(
            storage.get_file("/etc/passwd").await,
            Err(StorageError::InvalidRef(_))
        ));
    }

    #[tokio::test]
    async fn memory_storage_round_trips_and_deletes() {
        let storage = MemoryStorage::new();
        storage.insert("bids/a.xlsx", vec![1, 2, 3]).await;
        assert_eq!(storage.get_file("bids/a.xlsx").await.unwrap(), vec![1, 2, 3]);
        storage
            .delete_files(&["bids/a.xlsx".to_string()])
            .await
            .unwrap();
        assert!(storage.get_file("bids/a.xlsx").await.is_err());
    }
}
