//! A loaded workspace: the single live document instance and its fan-out
//!
//! Every mutation of a workspace goes through its entry, which serializes them
//! on the document lock, bumps the entry version and publishes the resulting
//! delta to attached sessions while still holding that lock. Publishing under
//! the lock keeps the broadcast order identical to the apply order.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex, Notify};
use uuid::Uuid;

use crate::convergent::{Delta, Document, DocumentSnapshot, Operation};
use crate::storage::PersistenceAdapter;

use super::{RegistryConfig, RegistryError};

/// Lifecycle phase of a registry slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Unloaded,
    Loading,
    Active,
    Persisting,
    Evicting,
}

/// One delta published to a workspace's sessions
#[derive(Clone, Debug)]
pub struct DeltaMessage {
    /// Session that produced the delta, if any
    pub origin: Option<Uuid>,
    /// Entry version after the delta was applied
    pub version: u64,
    pub delta: Arc<Delta>,
}

pub struct WorkspaceEntry {
    workspace_id: Uuid,
    document: Mutex<Document>,
    fanout: broadcast::Sender<DeltaMessage>,
    /// Bumped on every visible change, always under the document lock
    version: AtomicU64,
    persisted: AtomicU64,
    /// Changed only while the registry slot table is locked
    sessions: AtomicUsize,
    /// Bumped on attach; a pending eviction only proceeds if it is unchanged
    eviction_epoch: AtomicU64,
    phase: std::sync::Mutex<EntryState>,
    last_touched: std::sync::Mutex<DateTime<Utc>>,
    flush_lock: Mutex<()>,
    mutated: Notify,
    closed: watch::Sender<bool>,
}

impl WorkspaceEntry {
    pub(crate) fn new(workspace_id: Uuid, document: Document, fanout_capacity: usize) -> Self {
        let (fanout, _) = broadcast::channel(fanout_capacity.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            workspace_id,
            document: Mutex::new(document),
            fanout,
            version: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            sessions: AtomicUsize::new(0),
            eviction_epoch: AtomicU64::new(0),
            phase: std::sync::Mutex::new(EntryState::Active),
            last_touched: std::sync::Mutex::new(Utc::now()),
            flush_lock: Mutex::new(()),
            mutated: Notify::new(),
            closed,
        }
    }

    pub fn workspace_id(&self) -> Uuid {
        self.workspace_id
    }

    pub fn state(&self) -> EntryState {
        self.phase.lock().map(|p| *p).unwrap_or(EntryState::Active)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// True while the live document holds changes not yet saved
    pub fn is_dirty(&self) -> bool {
        self.version.load(Ordering::SeqCst) > self.persisted.load(Ordering::SeqCst)
    }

    pub fn last_touched(&self) -> DateTime<Utc> {
        self.last_touched
            .lock()
            .map(|t| *t)
            .unwrap_or_else(|_| Utc::now())
    }

    /// Apply a local operation and publish its delta
    pub async fn apply(
        &self,
        op: Operation,
        origin: Option<Uuid>,
    ) -> Result<Arc<Delta>, RegistryError> {
        let mut document = self.document.lock().await;
        self.ensure_open()?;
        let delta = Arc::new(document.apply_local(op)?);
        if !delta.is_empty() {
            self.publish(Arc::clone(&delta), origin);
        }
        Ok(delta)
    }

    /// Merge a delta from another replica, publishing it only if it changed
    /// visible state
    pub async fn merge(&self, delta: Delta, origin: Option<Uuid>) -> Result<bool, RegistryError> {
        let mut document = self.document.lock().await;
        self.ensure_open()?;
        let changed = document.merge_remote(&delta)?;
        if changed {
            self.publish(Arc::new(delta), origin);
        }
        Ok(changed)
    }

    /// Must be called with the document lock held
    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.is_closed() {
            return Err(RegistryError::Closed(self.workspace_id));
        }
        Ok(())
    }

    /// Must be called with the document lock held
    fn publish(&self, delta: Arc<Delta>, origin: Option<Uuid>) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.touch();
        // No receivers is fine: nobody else is attached
        let _ = self.fanout.send(DeltaMessage {
            origin,
            version,
            delta,
        });
        self.mutated.notify_one();
    }

    /// Current document plus a subscription that starts exactly after it
    pub async fn subscribe(&self) -> (Document, broadcast::Receiver<DeltaMessage>) {
        let document = self.document.lock().await;
        (document.clone(), self.fanout.subscribe())
    }

    pub async fn document(&self) -> Document {
        self.document.lock().await.clone()
    }

    pub async fn snapshot(&self) -> DocumentSnapshot {
        self.document.lock().await.snapshot()
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_touched.lock() {
            *t = Utc::now();
        }
    }

    pub(crate) fn set_state(&self, state: EntryState) {
        if let Ok(mut phase) = self.phase.lock() {
            *phase = state;
        }
    }

    /// Move from `from` to `to`; leaves other phases alone
    fn transition(&self, from: EntryState, to: EntryState) -> bool {
        match self.phase.lock() {
            Ok(mut phase) if *phase == from => {
                *phase = to;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn attach_session(&self) -> usize {
        self.eviction_epoch.fetch_add(1, Ordering::SeqCst);
        self.touch();
        self.sessions.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn detach_session(&self) -> usize {
        self.touch();
        let previous = self
            .sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub(crate) fn eviction_epoch(&self) -> u64 {
        self.eviction_epoch.load(Ordering::SeqCst)
    }

    /// True once the registry has dropped this entry; it takes no more edits
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub(crate) fn close(&self) {
        let _ = self.closed.send(true);
    }

    /// Close only if every applied edit has been persisted.
    ///
    /// Taken under the document lock, so no edit can slip in between the
    /// dirty check and the close.
    pub(crate) async fn close_if_clean(&self) -> bool {
        let _document = self.document.lock().await;
        if self.is_dirty() {
            return false;
        }
        self.close();
        true
    }

    /// Persist until the saved version catches up with the live one.
    ///
    /// The document lock is held only while serializing. Edits that land
    /// during the save bump the version, so the loop picks them up on the next
    /// pass instead of losing them.
    pub(crate) async fn flush(
        &self,
        store: &dyn PersistenceAdapter,
        config: &RegistryConfig,
    ) -> Result<(), RegistryError> {
        let _guard = self.flush_lock.lock().await;

        loop {
            let (bytes, version) = {
                let document = self.document.lock().await;
                let version = self.version.load(Ordering::SeqCst);
                if version == self.persisted.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let bytes = document.serialize().map_err(|e| RegistryError::Persist {
                    workspace: self.workspace_id,
                    reason: e.to_string(),
                })?;
                (bytes, version)
            };

            let was_active = self.transition(EntryState::Active, EntryState::Persisting);
            let saved = save_with_retry(store, self.workspace_id, &bytes, config).await;
            if was_active {
                self.transition(EntryState::Persisting, EntryState::Active);
            }
            saved?;

            self.persisted.store(version, Ordering::SeqCst);
            log::debug!(
                "Persisted workspace {} at version {} ({} bytes)",
                self.workspace_id,
                version,
                bytes.len()
            );
        }
    }

    /// Persist after `idle_flush` of quiet following each burst of edits.
    pub(crate) fn spawn_idle_flusher(
        self: &Arc<Self>,
        store: Arc<dyn PersistenceAdapter>,
        config: RegistryConfig,
    ) {
        let entry = Arc::clone(self);
        let mut closed = self.closed.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = entry.mutated.notified() => {}
                    _ = closed.changed() => break,
                }

                // Debounce: wait until edits stop arriving
                loop {
                    tokio::select! {
                        _ = entry.mutated.notified() => continue,
                        _ = tokio::time::sleep(config.idle_flush) => break,
                        _ = closed.changed() => return,
                    }
                }

                if let Err(e) = entry.flush(store.as_ref(), &config).await {
                    log::error!("Idle flush failed, will retry: {}", e);
                    entry.mutated.notify_one();
                }
            }
        });
    }
}

async fn save_with_retry(
    store: &dyn PersistenceAdapter,
    workspace_id: Uuid,
    bytes: &[u8],
    config: &RegistryConfig,
) -> Result<(), RegistryError> {
    let mut backoff = config.retry_backoff;
    let mut attempt = 0;
    loop {
        match store.save(workspace_id, bytes).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < config.persist_retries => {
                attempt += 1;
                log::warn!(
                    "Save of workspace {} failed (attempt {}): {}; retrying in {:?}",
                    workspace_id,
                    attempt,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2).min(Duration::from_secs(30));
            }
            Err(e) => {
                return Err(RegistryError::Persist {
                    workspace: workspace_id,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::Anchor;
    use crate::storage::MemoryStore;

    fn make_entry() -> WorkspaceEntry {
        WorkspaceEntry::new(Uuid::new_v4(), Document::new(Uuid::new_v4()), 8)
    }

    fn fast_config() -> RegistryConfig {
        RegistryConfig {
            retry_backoff: Duration::from_millis(1),
            persist_retries: 2,
            ..RegistryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_apply_marks_dirty_and_publishes() {
        let entry = make_entry();
        let (_, mut rx) = entry.subscribe().await;
        let session = Uuid::new_v4();

        entry
            .apply(Operation::create_tag("issue", None), Some(session))
            .await
            .unwrap();

        assert!(entry.is_dirty());
        let message = rx.recv().await.unwrap();
        assert_eq!(message.origin, Some(session));
        assert_eq!(message.version, 1);
    }

    #[tokio::test]
    async fn test_empty_delta_is_not_published() {
        let entry = make_entry();
        entry
            .apply(Operation::remove_highlight(Uuid::new_v4()), None)
            .await
            .unwrap();
        assert!(!entry.is_dirty());
        assert_eq!(entry.version(), 0);
    }

    #[tokio::test]
    async fn test_flush_clears_dirty() {
        let entry = make_entry();
        let store = MemoryStore::new();
        entry
            .apply(
                Operation::add_highlight(Anchor::root(0), Anchor::root(3), Uuid::new_v4()),
                None,
            )
            .await
            .unwrap();

        entry.flush(&store, &fast_config()).await.unwrap();
        assert!(!entry.is_dirty());
        assert_eq!(store.save_count(), 1);

        // Clean entry: nothing to write
        entry.flush(&store, &fast_config()).await.unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(entry.state(), EntryState::Active);
    }

    #[tokio::test]
    async fn test_flush_retries_transient_failures() {
        let entry = make_entry();
        let store = MemoryStore::new();
        store.fail_next_saves(2);
        entry
            .apply(Operation::create_tag("issue", None), None)
            .await
            .unwrap();

        entry.flush(&store, &fast_config()).await.unwrap();
        assert_eq!(store.save_count(), 3);
        assert!(store.get(entry.workspace_id()).await.is_some());
    }

    #[tokio::test]
    async fn test_flush_gives_up_but_keeps_state() {
        let entry = make_entry();
        let store = MemoryStore::new();
        store.fail_next_saves(10);
        entry
            .apply(Operation::create_tag("issue", None), None)
            .await
            .unwrap();

        let result = entry.flush(&store, &fast_config()).await;
        assert!(matches!(result, Err(RegistryError::Persist { .. })));
        assert!(entry.is_dirty());
        assert_eq!(entry.document().await.tags().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_during_save_is_persisted_by_same_flush() {
        let entry = Arc::new(make_entry());
        let store = Arc::new(MemoryStore::new());
        store.set_save_delay(Some(Duration::from_millis(100))).await;
        entry
            .apply(Operation::create_tag("first", None), None)
            .await
            .unwrap();

        let flushing = {
            let entry = Arc::clone(&entry);
            let store = Arc::clone(&store);
            tokio::spawn(async move { entry.flush(store.as_ref(), &fast_config()).await })
        };

        // Lands while the first save is still in flight
        tokio::time::sleep(Duration::from_millis(50)).await;
        entry
            .apply(Operation::create_tag("second", None), None)
            .await
            .unwrap();

        flushing.await.unwrap().unwrap();
        assert!(!entry.is_dirty());
        assert_eq!(store.save_count(), 2);
        let saved = Document::deserialize(&store.get(entry.workspace_id()).await.unwrap()).unwrap();
        assert_eq!(saved.tags().len(), 2);
    }

    #[tokio::test]
    async fn test_closed_entry_rejects_edits() {
        let entry = make_entry();
        entry
            .apply(Operation::create_tag("issue", None), None)
            .await
            .unwrap();
        assert!(!entry.close_if_clean().await);
        assert!(!entry.is_closed());

        entry.flush(&MemoryStore::new(), &fast_config()).await.unwrap();
        assert!(entry.close_if_clean().await);
        assert!(entry.is_closed());

        let result = entry.apply(Operation::create_tag("late", None), None).await;
        assert!(matches!(result, Err(RegistryError::Closed(id)) if id == entry.workspace_id()));
        assert!(!entry.is_dirty());
    }

    #[tokio::test]
    async fn test_detach_never_underflows() {
        let entry = make_entry();
        assert_eq!(entry.attach_session(), 1);
        assert_eq!(entry.detach_session(), 0);
        assert_eq!(entry.detach_session(), 0);
    }
}
