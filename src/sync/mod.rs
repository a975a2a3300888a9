//! Multi-client synchronization
//!
//! A `SessionManager` attaches client connections to the registry's live
//! document for a workspace, applies their edits, and relays each resulting
//! delta to every other session attached to the same workspace. Sessions see
//! deltas in the order they were applied and never receive their own.

mod session;

pub use session::{SessionHandle, SyncEvent};

use session::Lease;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::access::{Authorization, Permission, UserId, WorkspaceId};
use crate::convergent::{Delta, Document, DocumentError, Operation};
use crate::registry::{DocumentRegistry, RegistryError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("User {user_id} needs {required} access to workspace {workspace_id}")]
    PermissionDenied {
        workspace_id: WorkspaceId,
        user_id: UserId,
        required: Permission,
    },

    #[error("Rejected edit: {0}")]
    Validation(#[from] DocumentError),

    #[error(transparent)]
    Registry(RegistryError),

    #[error("Unknown session {0}")]
    UnknownSession(Uuid),
}

impl From<RegistryError> for SyncError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::Rejected(e) => SyncError::Validation(e),
            other => SyncError::Registry(other),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SessionInfo {
    workspace_id: WorkspaceId,
    user_id: UserId,
}

/// Attaches sessions to workspaces and routes their edits.
pub struct SessionManager {
    registry: DocumentRegistry,
    authz: Arc<dyn Authorization>,
    sessions: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,
}

impl SessionManager {
    pub fn new(registry: DocumentRegistry, authz: Arc<dyn Authorization>) -> Self {
        Self {
            registry,
            authz,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    /// Attach `user_id` to a workspace, loading it if needed.
    ///
    /// The handle carries the full current document; its subscription
    /// starts exactly after that state.
    pub async fn attach(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
    ) -> Result<SessionHandle, SyncError> {
        let permission = self
            .check_permission(workspace_id, user_id, Permission::Viewer)
            .await?;

        let entry = self.registry.acquire(workspace_id).await?;
        let (document, receiver) = entry.subscribe().await;
        let lease = Lease {
            registry: self.registry.clone(),
            sessions: Arc::clone(&self.sessions),
        };
        let handle = SessionHandle::new(
            workspace_id,
            user_id,
            permission,
            entry,
            document,
            receiver,
            lease,
        );

        self.sessions.write().await.insert(
            handle.session_id(),
            SessionInfo {
                workspace_id,
                user_id,
            },
        );
        log::info!(
            "Session {} attached user {} to workspace {} as {}",
            handle.session_id(),
            user_id,
            workspace_id,
            permission
        );
        Ok(handle)
    }

    /// Apply an edit on behalf of a session and relay it to the others.
    pub async fn submit(
        &self,
        handle: &SessionHandle,
        op: Operation,
    ) -> Result<Arc<Delta>, SyncError> {
        let info = self.session(handle).await?;
        self.ensure_open()?;
        self.check_permission(info.workspace_id, info.user_id, op.required_permission())
            .await?;

        let delta = handle.entry.apply(op, Some(handle.session_id())).await?;
        log::debug!(
            "Session {} applied an edit to workspace {}",
            handle.session_id(),
            info.workspace_id
        );
        Ok(delta)
    }

    /// Merge a delta produced by a client-side replica.
    ///
    /// Returns whether it changed anything; unchanged deltas are not relayed.
    /// Whatever origin the client put on the delta is replaced by the
    /// session id before it is relayed.
    pub async fn submit_delta(
        &self,
        handle: &SessionHandle,
        delta: Delta,
    ) -> Result<bool, SyncError> {
        let info = self.session(handle).await?;
        self.ensure_open()?;
        self.check_permission(info.workspace_id, info.user_id, delta.required_permission())
            .await?;

        let delta = delta.relayed_from(handle.session_id());
        Ok(handle.entry.merge(delta, Some(handle.session_id())).await?)
    }

    /// Drop any queued deltas and return the current document
    pub async fn resync(&self, handle: &mut SessionHandle) -> Result<Document, SyncError> {
        self.session(handle).await?;
        Ok(handle.resubscribe().await)
    }

    /// End a session. The last detach from a workspace starts its eviction grace.
    pub async fn detach(&self, mut handle: SessionHandle) -> Result<(), SyncError> {
        let removed = self.sessions.write().await.remove(&handle.session_id());
        if removed.is_none() {
            return Err(SyncError::UnknownSession(handle.session_id()));
        }
        handle.take_lease();

        self.registry.release(&handle.entry).await;
        log::info!(
            "Session {} detached from workspace {}",
            handle.session_id(),
            handle.workspace_id()
        );
        Ok(())
    }

    /// Number of sessions this manager has attached to a workspace
    pub async fn session_count(&self, workspace_id: WorkspaceId) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|info| info.workspace_id == workspace_id)
            .count()
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.registry.is_shutting_down() {
            return Err(RegistryError::ShuttingDown.into());
        }
        Ok(())
    }

    async fn session(&self, handle: &SessionHandle) -> Result<SessionInfo, SyncError> {
        self.sessions
            .read()
            .await
            .get(&handle.session_id())
            .copied()
            .ok_or(SyncError::UnknownSession(handle.session_id()))
    }

    /// Current permission, re-read on every call so revocations apply at once
    async fn check_permission(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
        required: Permission,
    ) -> Result<Permission, SyncError> {
        match self.authz.permission_level(workspace_id, user_id).await {
            Some(permission) if permission.at_least(required) => Ok(permission),
            _ => {
                log::info!(
                    "Denied user {} on workspace {}: needs {}",
                    user_id,
                    workspace_id,
                    required
                );
                Err(SyncError::PermissionDenied {
                    workspace_id,
                    user_id,
                    required,
                })
            }
        }
    }
}
