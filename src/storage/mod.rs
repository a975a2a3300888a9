//! Persistence for workspace document blobs
//!
//! The engine's only durability boundary. A blob is the serialized document of
//! one workspace; adapters treat it as opaque bytes.

pub mod local;
pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use local::LocalStore;
pub use memory::MemoryStore;

/// Error types for storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Loads and saves serialized documents, keyed by workspace.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Fetch the stored blob, or `None` if the workspace has never been saved
    async fn load(&self, workspace_id: Uuid) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a blob. A completed save is durable.
    async fn save(&self, workspace_id: Uuid, data: &[u8]) -> Result<(), StorageError>;
}

/// Configuration for the on-disk store
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Base directory for document blobs
    pub base_dir: PathBuf,

    /// Call fsync before the rename that publishes a blob
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./marginalia_data"),
            sync_writes: true,
        }
    }
}
