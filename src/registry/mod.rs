//! Document registry
//!
//! Process-wide cache of loaded workspace documents. The registry guarantees at
//! most one live `Document` per workspace, so every session editing a
//! workspace mutates the same instance.
//!
//! # Entry lifecycle
//!
//! ```text
//! UNLOADED ──attach──▶ LOADING ──load ok──▶ ACTIVE ⇄ PERSISTING
//!     ▲                   │                   │
//!     │               load error        last detach + grace
//!     │                   ▼                   ▼
//!     └──────────────── (slot cleared) ◀── EVICTING ──attach──▶ ACTIVE
//! ```
//!
//! Concurrent attaches during LOADING share the single in-flight load. A load
//! that outlives `load_timeout` keeps running so the next attach can pick up
//! its result.

mod config;
mod entry;

pub use config::RegistryConfig;
pub use entry::{DeltaMessage, EntryState, WorkspaceEntry};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::convergent::{Document, DocumentError, DocumentSnapshot, ReplicaId};
use crate::storage::PersistenceAdapter;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Corrupt state for workspace {workspace}: {reason}")]
    CorruptState { workspace: Uuid, reason: String },

    #[error("Timed out loading workspace {0}")]
    LoadTimeout(Uuid),

    #[error("Storage error loading workspace {workspace}: {reason}")]
    Load { workspace: Uuid, reason: String },

    #[error("Persist error for workspace {workspace}: {reason}")]
    Persist { workspace: Uuid, reason: String },

    #[error("Rejected edit: {0}")]
    Rejected(#[from] DocumentError),

    #[error("Workspace {0} is no longer loaded")]
    Closed(Uuid),

    #[error("Registry is shutting down")]
    ShuttingDown,
}

type LoadResult = Option<Result<Arc<WorkspaceEntry>, RegistryError>>;

enum Slot {
    Loading(watch::Receiver<LoadResult>),
    Ready(Arc<WorkspaceEntry>),
}

struct Inner {
    store: Arc<dyn PersistenceAdapter>,
    config: RegistryConfig,
    replica: ReplicaId,
    slots: Mutex<HashMap<Uuid, Slot>>,
    shutting_down: AtomicBool,
}

/// Cache of loaded workspaces. Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct DocumentRegistry {
    inner: Arc<Inner>,
}

impl DocumentRegistry {
    pub fn new(store: Arc<dyn PersistenceAdapter>, config: RegistryConfig) -> Self {
        Self::with_replica(store, config, Uuid::new_v4())
    }

    /// Create a registry whose new documents use a fixed replica id
    pub fn with_replica(
        store: Arc<dyn PersistenceAdapter>,
        config: RegistryConfig,
        replica: ReplicaId,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                replica,
                slots: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Lend the workspace's entry to a new session, loading it if needed.
    ///
    /// The returned entry counts one more attached session; pair every
    /// successful call with `release`.
    pub async fn acquire(&self, workspace_id: Uuid) -> Result<Arc<WorkspaceEntry>, RegistryError> {
        loop {
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return Err(RegistryError::ShuttingDown);
            }

            let mut rx = {
                let mut slots = self.inner.slots.lock().await;
                match slots.get(&workspace_id) {
                    Some(Slot::Ready(entry)) => {
                        let count = entry.attach_session();
                        log::debug!("Workspace {} now has {} sessions", workspace_id, count);
                        return Ok(Arc::clone(entry));
                    }
                    Some(Slot::Loading(rx)) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        slots.insert(workspace_id, Slot::Loading(rx.clone()));
                        self.spawn_load(workspace_id, tx, rx.clone());
                        rx
                    }
                }
            };

            let loaded = tokio::time::timeout(
                self.inner.config.load_timeout,
                wait_loaded(workspace_id, &mut rx),
            )
            .await
            .map_err(|_| {
                log::warn!("Attach to workspace {} timed out while loading", workspace_id);
                RegistryError::LoadTimeout(workspace_id)
            })??;

            // Count the session under the slot lock so eviction cannot race it
            let slots = self.inner.slots.lock().await;
            if let Some(Slot::Ready(entry)) = slots.get(&workspace_id) {
                if Arc::ptr_eq(entry, &loaded) {
                    entry.attach_session();
                    return Ok(loaded);
                }
            }
            // Evicted between load and attach; start over
        }
    }

    /// Like `acquire`, but installs an empty document if the stored one is
    /// corrupt. The bad blob stays in storage until new edits are flushed.
    pub async fn acquire_or_empty(
        &self,
        workspace_id: Uuid,
    ) -> Result<Arc<WorkspaceEntry>, RegistryError> {
        loop {
            let reason = match self.acquire(workspace_id).await {
                Err(RegistryError::CorruptState { reason, .. }) => reason,
                other => return other,
            };

            let mut slots = self.inner.slots.lock().await;
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return Err(RegistryError::ShuttingDown);
            }
            match slots.get(&workspace_id) {
                Some(Slot::Ready(entry)) => {
                    entry.attach_session();
                    return Ok(Arc::clone(entry));
                }
                // Someone else started a fresh load; wait on it like any attach
                Some(Slot::Loading(_)) => continue,
                None => {}
            }

            log::warn!(
                "Workspace {} is corrupt ({}); attaching to an empty document",
                workspace_id,
                reason
            );
            let entry = self.activate(workspace_id, Document::new(self.inner.replica));
            slots.insert(workspace_id, Slot::Ready(Arc::clone(&entry)));
            entry.attach_session();
            return Ok(entry);
        }
    }

    /// Return a session's loan. The last release starts the eviction grace.
    pub async fn release(&self, entry: &Arc<WorkspaceEntry>) {
        let remaining = {
            let _slots = self.inner.slots.lock().await;
            entry.detach_session()
        };
        if remaining == 0 {
            self.schedule_eviction(entry);
        }
    }

    /// Persist a loaded workspace now. Unloaded workspaces have nothing to do.
    pub async fn flush(&self, workspace_id: Uuid) -> Result<(), RegistryError> {
        match self.entry(workspace_id).await {
            Some(entry) => entry.flush(self.inner.store.as_ref(), &self.inner.config).await,
            None => Ok(()),
        }
    }

    /// Loaded entry for a workspace, without attaching to it
    pub async fn entry(&self, workspace_id: Uuid) -> Option<Arc<WorkspaceEntry>> {
        match self.inner.slots.lock().await.get(&workspace_id) {
            Some(Slot::Ready(entry)) => Some(Arc::clone(entry)),
            _ => None,
        }
    }

    /// Read-only view of a loaded workspace, for export
    pub async fn snapshot(&self, workspace_id: Uuid) -> Option<DocumentSnapshot> {
        match self.entry(workspace_id).await {
            Some(entry) => Some(entry.snapshot().await),
            None => None,
        }
    }

    pub async fn entry_state(&self, workspace_id: Uuid) -> EntryState {
        match self.inner.slots.lock().await.get(&workspace_id) {
            None => EntryState::Unloaded,
            Some(Slot::Loading(_)) => EntryState::Loading,
            Some(Slot::Ready(entry)) => entry.state(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn loaded_workspaces(&self) -> Vec<Uuid> {
        let slots = self.inner.slots.lock().await;
        let mut ids: Vec<Uuid> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Stop accepting attaches, flush every loaded workspace and drop them.
    ///
    /// Every entry is attempted; the first failure is returned.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let entries: Vec<Arc<WorkspaceEntry>> = {
            let mut slots = self.inner.slots.lock().await;
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready(entry) => Some(entry),
                    Slot::Loading(_) => None,
                })
                .collect()
        };
        log::info!("Shutting down registry, flushing {} workspaces", entries.len());

        let results = join_all(entries.iter().map(|entry| async move {
            entry.set_state(EntryState::Evicting);
            loop {
                let flushed = entry
                    .flush(self.inner.store.as_ref(), &self.inner.config)
                    .await;
                if let Err(e) = flushed {
                    entry.close();
                    return Err(e);
                }
                if entry.close_if_clean().await {
                    return Ok(());
                }
            }
        }))
        .await;

        results.into_iter().collect()
    }

    fn activate(&self, workspace_id: Uuid, document: Document) -> Arc<WorkspaceEntry> {
        let entry = Arc::new(WorkspaceEntry::new(
            workspace_id,
            document,
            self.inner.config.fanout_capacity,
        ));
        entry.spawn_idle_flusher(Arc::clone(&self.inner.store), self.inner.config.clone());
        entry
    }

    fn spawn_load(
        &self,
        workspace_id: Uuid,
        tx: watch::Sender<LoadResult>,
        rx: watch::Receiver<LoadResult>,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut guard = LoadGuard {
                registry: registry.clone(),
                workspace_id,
                rx,
                tx: Some(tx),
            };
            log::debug!("Loading workspace {}", workspace_id);
            let result = registry.load_document(workspace_id).await;

            let mut installed = None;
            let result = {
                let mut slots = registry.inner.slots.lock().await;
                let owned = guard.owns_slot(&slots);
                match result {
                    Ok(_) if registry.inner.shutting_down.load(Ordering::SeqCst) => {
                        if owned {
                            slots.remove(&workspace_id);
                        }
                        Err(RegistryError::ShuttingDown)
                    }
                    Ok(document) if owned => {
                        let entry = registry.activate(workspace_id, document);
                        slots.insert(workspace_id, Slot::Ready(Arc::clone(&entry)));
                        installed = Some(Arc::clone(&entry));
                        Ok(entry)
                    }
                    // The slot moved on without us; point waiters at whatever holds it
                    Ok(_) => match slots.get(&workspace_id) {
                        Some(Slot::Ready(entry)) => Ok(Arc::clone(entry)),
                        _ => Err(RegistryError::Load {
                            workspace: workspace_id,
                            reason: "slot was replaced while loading".into(),
                        }),
                    },
                    Err(e) => {
                        log::error!("Failed to load workspace {}: {}", workspace_id, e);
                        if owned {
                            slots.remove(&workspace_id);
                        }
                        Err(e)
                    }
                }
            };

            // Waiters that timed out never attach; the grace timer reclaims it
            if let Some(entry) = &installed {
                registry.schedule_eviction(entry);
            }
            guard.complete(result);
        });
    }

    async fn load_document(&self, workspace_id: Uuid) -> Result<Document, RegistryError> {
        let blob = self
            .inner
            .store
            .load(workspace_id)
            .await
            .map_err(|e| RegistryError::Load {
                workspace: workspace_id,
                reason: e.to_string(),
            })?;

        match blob {
            None => Ok(Document::new(self.inner.replica)),
            Some(bytes) if bytes.is_empty() => Ok(Document::new(self.inner.replica)),
            Some(bytes) => Document::deserialize(&bytes).map_err(|e| match e {
                DocumentError::CorruptState(reason) => RegistryError::CorruptState {
                    workspace: workspace_id,
                    reason,
                },
                other => RegistryError::Load {
                    workspace: workspace_id,
                    reason: other.to_string(),
                },
            }),
        }
    }

    fn schedule_eviction(&self, entry: &Arc<WorkspaceEntry>) {
        let registry = self.clone();
        let entry = Arc::clone(entry);
        let epoch = entry.eviction_epoch();
        tokio::spawn(async move {
            tokio::time::sleep(registry.inner.config.eviction_grace).await;
            registry.try_evict(entry, epoch).await;
        });
    }

    async fn try_evict(&self, entry: Arc<WorkspaceEntry>, epoch: u64) {
        let workspace_id = entry.workspace_id();
        {
            let _slots = self.inner.slots.lock().await;
            if entry.session_count() > 0 || entry.eviction_epoch() != epoch {
                return;
            }
            entry.set_state(EntryState::Evicting);
        }

        loop {
            if let Err(e) = entry
                .flush(self.inner.store.as_ref(), &self.inner.config)
                .await
            {
                log::error!(
                    "Final flush of workspace {} failed, keeping it loaded: {}",
                    workspace_id,
                    e
                );
                entry.set_state(EntryState::Active);
                self.schedule_eviction(&entry);
                return;
            }

            let mut slots = self.inner.slots.lock().await;
            if entry.session_count() > 0 || entry.eviction_epoch() != epoch {
                log::debug!("Workspace {} reattached during eviction", workspace_id);
                entry.set_state(EntryState::Active);
                return;
            }
            if !entry.close_if_clean().await {
                continue;
            }
            let same_entry = matches!(
                slots.get(&workspace_id),
                Some(Slot::Ready(current)) if Arc::ptr_eq(current, &entry)
            );
            if same_entry {
                slots.remove(&workspace_id);
            }
            log::info!("Evicted workspace {}", workspace_id);
            return;
        }
    }
}

async fn wait_loaded(
    workspace_id: Uuid,
    rx: &mut watch::Receiver<LoadResult>,
) -> Result<Arc<WorkspaceEntry>, RegistryError> {
    loop {
        let current = rx.borrow().clone();
        if let Some(result) = current {
            return result;
        }
        if rx.changed().await.is_err() {
            // Loader vanished without reporting; its guard has cleared the slot
            return Err(RegistryError::Load {
                workspace: workspace_id,
                reason: "load ended without a result".into(),
            });
        }
    }
}

/// Owns an in-flight load's slot. If the load task dies before reporting, the
/// slot is cleared so the next attach starts over instead of waiting forever.
struct LoadGuard {
    registry: DocumentRegistry,
    workspace_id: Uuid,
    rx: watch::Receiver<LoadResult>,
    tx: Option<watch::Sender<LoadResult>>,
}

impl LoadGuard {
    fn owns_slot(&self, slots: &HashMap<Uuid, Slot>) -> bool {
        owns_slot(slots, self.workspace_id, &self.rx)
    }

    fn complete(&mut self, result: Result<Arc<WorkspaceEntry>, RegistryError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if self.tx.is_none() {
            return;
        }
        log::error!("Load of workspace {} ended without a result", self.workspace_id);

        if let Ok(mut slots) = self.registry.inner.slots.try_lock() {
            clear_own_slot(&mut slots, self.workspace_id, &self.rx);
            return;
        }
        let registry = self.registry.clone();
        let workspace_id = self.workspace_id;
        let rx = self.rx.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut slots = registry.inner.slots.lock().await;
                    clear_own_slot(&mut slots, workspace_id, &rx);
                });
            }
            Err(_) => log::warn!("No runtime to clear the slot of workspace {}", workspace_id),
        }
    }
}

fn owns_slot(
    slots: &HashMap<Uuid, Slot>,
    workspace_id: Uuid,
    rx: &watch::Receiver<LoadResult>,
) -> bool {
    matches!(slots.get(&workspace_id), Some(Slot::Loading(current)) if current.same_channel(rx))
}

fn clear_own_slot(
    slots: &mut HashMap<Uuid, Slot>,
    workspace_id: Uuid,
    rx: &watch::Receiver<LoadResult>,
) {
    if owns_slot(slots, workspace_id, rx) {
        slots.remove(&workspace_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::{Anchor, Operation};
    use crate::storage::{MemoryStore, StorageError};
    use async_trait::async_trait;
    use std::time::Duration;

    fn config() -> RegistryConfig {
        RegistryConfig {
            idle_flush: Duration::from_millis(50),
            eviction_grace: Duration::from_millis(500),
            load_timeout: Duration::from_secs(1),
            persist_retries: 2,
            retry_backoff: Duration::from_millis(10),
            fanout_capacity: 16,
        }
    }

    fn registry(store: &Arc<MemoryStore>) -> DocumentRegistry {
        DocumentRegistry::new(Arc::clone(store) as Arc<dyn PersistenceAdapter>, config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_attach_loads_once() {
        let store = Arc::new(MemoryStore::new());
        store.set_load_delay(Some(Duration::from_millis(200))).await;
        let registry = registry(&store);
        let ws = Uuid::new_v4();

        let (a, b) = tokio::join!(registry.acquire(ws), registry.acquire(ws));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.load_count(), 1);
        assert_eq!(a.session_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_timeout_leaves_load_in_flight() {
        let store = Arc::new(MemoryStore::new());
        store.set_load_delay(Some(Duration::from_millis(1500))).await;
        let registry = registry(&store);
        let ws = Uuid::new_v4();

        let first = registry.acquire(ws).await;
        assert!(matches!(first, Err(RegistryError::LoadTimeout(id)) if id == ws));
        assert_eq!(registry.entry_state(ws).await, EntryState::Loading);

        // Second attempt joins the same load instead of starting another
        let entry = registry.acquire(ws).await.unwrap();
        assert_eq!(store.load_count(), 1);
        assert_eq!(entry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_blob_surfaces_and_can_fall_back() {
        let store = Arc::new(MemoryStore::new());
        let ws = Uuid::new_v4();
        store.insert(ws, vec![0xde, 0xad, 0xbe, 0xef]).await;
        let registry = registry(&store);

        let result = registry.acquire(ws).await;
        assert!(matches!(result, Err(RegistryError::CorruptState { .. })));
        assert_eq!(registry.entry_state(ws).await, EntryState::Unloaded);

        let entry = registry.acquire_or_empty(ws).await.unwrap();
        assert_eq!(entry.document().await.highlights().count(), 0);
        // The bad blob is untouched until something new is saved
        assert_eq!(store.get(ws).await, Some(vec![0xde, 0xad, 0xbe, 0xef]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fallbacks_share_one_empty_document() {
        let store = Arc::new(MemoryStore::new());
        let ws = Uuid::new_v4();
        store.insert(ws, vec![0xde, 0xad]).await;
        store.set_load_delay(Some(Duration::from_millis(100))).await;
        let registry = registry(&store);

        let (a, b, plain) = tokio::join!(
            registry.acquire_or_empty(ws),
            async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                registry.acquire_or_empty(ws).await
            },
            registry.acquire(ws),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(matches!(plain, Err(RegistryError::CorruptState { .. })));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&registry.entry(ws).await.unwrap(), &a));
        assert_eq!(a.session_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_load_leaves_replaced_slot_alone() {
        let store = Arc::new(MemoryStore::new());
        let ws = Uuid::new_v4();
        store.insert(ws, vec![0xde, 0xad]).await;
        store.set_load_delay(Some(Duration::from_millis(100))).await;
        let registry = registry(&store);

        let (tx, rx) = watch::channel(None);
        registry
            .inner
            .slots
            .lock()
            .await
            .insert(ws, Slot::Loading(rx.clone()));
        registry.spawn_load(ws, tx, rx);

        // Another entry takes the slot before the stale load fails
        let current = registry.activate(ws, Document::new(Uuid::new_v4()));
        current.attach_session();
        registry
            .inner
            .slots
            .lock()
            .await
            .insert(ws, Slot::Ready(Arc::clone(&current)));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.load_count(), 1);
        let entry = registry.entry(ws).await.unwrap();
        assert!(Arc::ptr_eq(&entry, &current));
    }

    struct PanickingStore;

    #[async_trait]
    impl PersistenceAdapter for PanickingStore {
        async fn load(&self, _workspace_id: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
            panic!("storage driver crashed");
        }

        async fn save(&self, _workspace_id: Uuid, _data: &[u8]) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_crashed_load_clears_its_slot() {
        let registry = DocumentRegistry::new(Arc::new(PanickingStore), config());
        let ws = Uuid::new_v4();

        let result = registry.acquire(ws).await;
        assert!(matches!(result, Err(RegistryError::Load { workspace, .. }) if workspace == ws));
        assert_eq!(registry.entry_state(ws).await, EntryState::Unloaded);

        // The next attach starts a fresh load instead of timing out
        let again = registry.acquire(ws).await;
        assert!(matches!(again, Err(RegistryError::Load { .. })));
    }

    #[tokio::test]
    async fn test_empty_blob_is_empty_document() {
        let store = Arc::new(MemoryStore::new());
        let ws = Uuid::new_v4();
        store.insert(ws, Vec::new()).await;
        let registry = registry(&store);

        let entry = registry.acquire(ws).await.unwrap();
        assert_eq!(entry.document().await.tags().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_flush_persists_after_quiet_period() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let ws = Uuid::new_v4();
        let entry = registry.acquire(ws).await.unwrap();

        for name in ["a", "b", "c"] {
            entry
                .apply(Operation::create_tag(name, None), None)
                .await
                .unwrap();
        }
        assert_eq!(store.save_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.save_count(), 1);
        assert!(!entry.is_dirty());

        let saved = Document::deserialize(&store.get(ws).await.unwrap()).unwrap();
        assert_eq!(saved.tags().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_after_grace_flushes_and_unloads() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let ws = Uuid::new_v4();
        let entry = registry.acquire(ws).await.unwrap();
        entry
            .apply(
                Operation::add_highlight(Anchor::root(0), Anchor::root(2), Uuid::new_v4()),
                None,
            )
            .await
            .unwrap();

        registry.release(&entry).await;
        assert_eq!(registry.entry_state(ws).await, EntryState::Active);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.entry_state(ws).await, EntryState::Unloaded);
        assert!(store.get(ws).await.is_some());

        // Reload sees the flushed state
        let reloaded = registry.acquire(ws).await.unwrap();
        assert_eq!(reloaded.document().await.highlights().count(), 1);
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_during_grace_cancels_eviction() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let ws = Uuid::new_v4();

        let entry = registry.acquire(ws).await.unwrap();
        registry.release(&entry).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let again = registry.acquire(ws).await.unwrap();
        assert!(Arc::ptr_eq(&entry, &again));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.entry_state(ws).await, EntryState::Active);
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_during_final_flush_keeps_entry() {
        let store = Arc::new(MemoryStore::new());
        store.set_save_delay(Some(Duration::from_millis(100))).await;
        let registry = DocumentRegistry::new(
            Arc::clone(&store) as Arc<dyn PersistenceAdapter>,
            RegistryConfig {
                idle_flush: Duration::from_secs(60),
                ..config()
            },
        );
        let ws = Uuid::new_v4();
        let entry = registry.acquire(ws).await.unwrap();
        entry
            .apply(Operation::create_tag("claim", None), None)
            .await
            .unwrap();
        registry.release(&entry).await;

        // Grace ends at 500ms; the final save runs until 600ms
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(registry.entry_state(ws).await, EntryState::Evicting);
        let again = registry.acquire(ws).await.unwrap();
        assert!(Arc::ptr_eq(&entry, &again));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.entry_state(ws).await, EntryState::Active);
        assert!(!entry.is_closed());
        assert!(!entry.is_dirty());
        assert_eq!(store.load_count(), 1);
        assert_eq!(registry.loaded_workspaces().await, vec![ws]);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_everything() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let workspaces = [Uuid::new_v4(), Uuid::new_v4()];

        for ws in workspaces {
            let entry = registry.acquire(ws).await.unwrap();
            entry
                .apply(Operation::create_group("Issues", "#c00"), None)
                .await
                .unwrap();
        }

        let entry = registry.entry(workspaces[0]).await.unwrap();
        registry.shutdown().await.unwrap();
        assert!(registry.loaded_workspaces().await.is_empty());
        assert!(entry.is_closed());
        assert!(matches!(
            entry.apply(Operation::create_tag("late", None), None).await,
            Err(RegistryError::Closed(_))
        ));
        for ws in workspaces {
            assert!(store.get(ws).await.is_some());
        }
        assert!(matches!(
            registry.acquire(workspaces[0]).await,
            Err(RegistryError::ShuttingDown)
        ));
    }
}
