//! Local file system store for document blobs
//!
//! Blobs live at `{base_dir}/{prefix}/{workspace_id}.cbor`, where `prefix` is
//! the first two characters of the workspace id. Writes go to a temporary file
//! that is renamed over the target, so a crash mid-save leaves the previous
//! blob intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{PersistenceAdapter, StorageConfig, StorageError};

/// A persistence adapter that uses the local file system
pub struct LocalStore {
    config: StorageConfig,
}

impl LocalStore {
    /// Create a new local store, creating the base directory if needed
    pub async fn new(config: StorageConfig) -> Result<Self, StorageError> {
        if !config.base_dir.exists() {
            tokio_fs::create_dir_all(&config.base_dir).await?;
        }
        Ok(Self { config })
    }

    /// Get the path for a workspace blob
    fn blob_path(&self, workspace_id: Uuid) -> PathBuf {
        let id_str = workspace_id.to_string();
        let prefix = &id_str[0..2];
        self.config
            .base_dir
            .join(prefix)
            .join(format!("{}.cbor", id_str))
    }

    /// Ensure the directory for a path exists
    async fn ensure_dir(&self, path: &Path) -> Result<(), StorageError> {
        let parent = path.parent().ok_or_else(|| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Invalid path",
            ))
        })?;

        if !parent.exists() {
            tokio_fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// List every workspace with a stored blob
    pub async fn list(&self) -> Result<Vec<Uuid>, StorageError> {
        let mut ids = Vec::new();
        if !self.config.base_dir.exists() {
            return Ok(ids);
        }

        let mut dir_entries = tokio_fs::read_dir(&self.config.base_dir).await?;
        while let Some(entry) = dir_entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let mut file_entries = tokio_fs::read_dir(&path).await?;
            while let Some(file_entry) = file_entries.next_entry().await? {
                let file_path = file_entry.path();
                if file_path.extension().and_then(|ext| ext.to_str()) != Some("cbor") {
                    continue;
                }
                if let Some(stem) = file_path.file_stem().and_then(|s| s.to_str()) {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl PersistenceAdapter for LocalStore {
    async fn load(&self, workspace_id: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.blob_path(workspace_id);
        match tokio_fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, workspace_id: Uuid, data: &[u8]) -> Result<(), StorageError> {
        let path = self.blob_path(workspace_id);
        self.ensure_dir(&path).await?;

        let tmp_path = path.with_extension("cbor.tmp");
        let mut file = tokio_fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        if self.config.sync_writes {
            file.sync_all().await?;
        }
        drop(file);

        tokio_fs::rename(&tmp_path, &path).await?;
        log::debug!("Saved {} bytes for workspace {}", data.len(), workspace_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_store(dir: &Path) -> LocalStore {
        LocalStore::new(StorageConfig {
            base_dir: dir.join("blobs"),
            sync_writes: false,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_missing_blob_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path()).await;

        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path()).await;
        let id = Uuid::new_v4();

        store.save(id, b"first").await.unwrap();
        store.save(id, b"second").await.unwrap();

        assert_eq!(store.load(id).await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_blobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        {
            let store = make_store(dir.path()).await;
            store.save(a, b"a").await.unwrap();
            store.save(b, b"b").await.unwrap();
        }

        let store = make_store(dir.path()).await;
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.list().await.unwrap(), expected);
        assert_eq!(store.load(a).await.unwrap(), Some(b"a".to_vec()));
    }
}
