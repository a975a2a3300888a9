//! In-memory store, for tests and ephemeral workspaces

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{PersistenceAdapter, StorageError};

/// Blob store held in a map.
///
/// Counts calls so callers can assert how often the registry touched storage,
/// and can be told to fail or stall to exercise retry and timeout paths.
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<Uuid, Vec<u8>>>,
    loads: AtomicUsize,
    saves: AtomicUsize,
    failing_saves: AtomicUsize,
    load_delay: RwLock<Option<Duration>>,
    save_delay: RwLock<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob directly, bypassing the save counter
    pub async fn insert(&self, workspace_id: Uuid, data: Vec<u8>) {
        self.blobs.write().await.insert(workspace_id, data);
    }

    pub async fn get(&self, workspace_id: Uuid) -> Option<Vec<u8>> {
        self.blobs.read().await.get(&workspace_id).cloned()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make the next `count` saves fail with `Unavailable`
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Delay every load by `delay`
    pub async fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.write().await = delay;
    }

    /// Delay every save by `delay`, before the blob is written
    pub async fn set_save_delay(&self, delay: Option<Duration>) {
        *self.save_delay.write().await = delay;
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryStore {
    async fn load(&self, workspace_id: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.get(workspace_id).await)
    }

    async fn save(&self, workspace_id: Uuid, data: &[u8]) -> Result<(), StorageError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::Unavailable("injected save failure".into()));
        }
        let delay = *self.save_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.insert(workspace_id, data.to_vec()).await;
        Ok(())
    }
}
