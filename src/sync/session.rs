//! One client's attachment to a workspace

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use super::SessionInfo;
use crate::access::{Permission, UserId, WorkspaceId};
use crate::convergent::{Delta, Document, DocumentSnapshot};
use crate::registry::{DeltaMessage, DocumentRegistry, WorkspaceEntry};

/// What an attached session receives
#[derive(Clone, Debug)]
pub enum SyncEvent {
    /// An edit made by another session, in apply order
    Delta(Arc<Delta>),
    /// The session fell behind; replace local state with this document
    Resync(Document),
}

/// The manager state a handle gives back when it goes away without `detach`
pub(crate) struct Lease {
    pub(crate) registry: DocumentRegistry,
    pub(crate) sessions: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,
}

/// Handle returned by `SessionManager::attach`.
///
/// Holds the document state at attach time and the subscription for every
/// later change. Pass it back to the manager to submit edits or detach.
/// Dropping it without detaching detaches in the background.
pub struct SessionHandle {
    session_id: Uuid,
    workspace_id: WorkspaceId,
    user_id: UserId,
    permission: Permission,
    initial: Document,
    receiver: broadcast::Receiver<DeltaMessage>,
    closed: watch::Receiver<bool>,
    lease: Option<Lease>,
    pub(crate) entry: Arc<WorkspaceEntry>,
}

impl SessionHandle {
    pub(crate) fn new(
        workspace_id: WorkspaceId,
        user_id: UserId,
        permission: Permission,
        entry: Arc<WorkspaceEntry>,
        initial: Document,
        receiver: broadcast::Receiver<DeltaMessage>,
        lease: Lease,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            workspace_id,
            user_id,
            permission,
            initial,
            receiver,
            closed: entry.closed_signal(),
            lease: Some(lease),
            entry,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Permission held when the session attached
    pub fn permission(&self) -> Permission {
        self.permission
    }

    /// Full document as of attach (or the last resync)
    pub fn document(&self) -> &Document {
        &self.initial
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        self.initial.snapshot()
    }

    /// Wait for the next event from another session.
    ///
    /// Returns `None` once the workspace has been unloaded and everything
    /// published before that has been handed out.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            let closed = *self.closed.borrow();
            let message = if closed {
                match self.receiver.try_recv() {
                    Ok(message) => Ok(message),
                    Err(TryRecvError::Lagged(missed)) => Err(RecvError::Lagged(missed)),
                    Err(_) => return None,
                }
            } else {
                tokio::select! {
                    biased;
                    message = self.receiver.recv() => message,
                    changed = self.closed.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                        continue;
                    }
                }
            };

            match message {
                Ok(message) if message.origin == Some(self.session_id) => continue,
                Ok(message) => return Some(SyncEvent::Delta(message.delta)),
                Err(RecvError::Lagged(missed)) => {
                    log::warn!(
                        "Session {} lagged by {} deltas, resyncing",
                        self.session_id,
                        missed
                    );
                    return Some(SyncEvent::Resync(self.resubscribe().await));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Every event already queued, without waiting
    pub async fn drain(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(message) if message.origin == Some(self.session_id) => {}
                Ok(message) => events.push(SyncEvent::Delta(message.delta)),
                Err(TryRecvError::Lagged(missed)) => {
                    log::warn!(
                        "Session {} lagged by {} deltas, resyncing",
                        self.session_id,
                        missed
                    );
                    // Anything queued before the resync is already in it
                    events.clear();
                    events.push(SyncEvent::Resync(self.resubscribe().await));
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
            }
        }
    }

    /// Replace the subscription with a fresh one starting at the current state
    pub(crate) async fn resubscribe(&mut self) -> Document {
        let (document, receiver) = self.entry.subscribe().await;
        self.receiver = receiver;
        self.initial = document.clone();
        document
    }

    /// Take over the release; the handle will no longer do it on drop
    pub(crate) fn take_lease(&mut self) -> Option<Lease> {
        self.lease.take()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let lease = match self.lease.take() {
            Some(lease) => lease,
            None => return,
        };
        let session_id = self.session_id;
        let entry = Arc::clone(&self.entry);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let removed = lease.sessions.write().await.remove(&session_id);
                    if removed.is_some() {
                        lease.registry.release(&entry).await;
                        log::info!(
                            "Session {} dropped without detach, released workspace {}",
                            session_id,
                            entry.workspace_id()
                        );
                    }
                });
            }
            Err(_) => log::warn!(
                "Session {} dropped outside a runtime; workspace {} stays attached",
                session_id,
                entry.workspace_id()
            ),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("workspace_id", &self.workspace_id)
            .field("user_id", &self.user_id)
            .field("permission", &self.permission)
            .finish()
    }
}
