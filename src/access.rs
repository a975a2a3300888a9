//! Workspace permissions and access control entries

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type WorkspaceId = Uuid;
pub type UserId = Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Unknown permission: {0}")]
    UnknownPermission(String),
}

/// Capability a user holds on a workspace, ordered from least to most permissive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Viewer,
    Commenter,
    Peer,
    Editor,
    Owner,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Permission::Viewer,
        Permission::Commenter,
        Permission::Peer,
        Permission::Editor,
        Permission::Owner,
    ];

    /// Ordinal level used for comparisons
    pub fn level(self) -> u8 {
        match self {
            Permission::Viewer => 10,
            Permission::Commenter => 20,
            Permission::Peer => 30,
            Permission::Editor => 40,
            Permission::Owner => 50,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Permission::Viewer => "viewer",
            Permission::Commenter => "commenter",
            Permission::Peer => "peer",
            Permission::Editor => "editor",
            Permission::Owner => "owner",
        }
    }

    pub fn at_least(self, required: Permission) -> bool {
        self.level() >= required.level()
    }

    pub fn most_permissive(self, other: Permission) -> Permission {
        if other.level() > self.level() {
            other
        } else {
            self
        }
    }

    pub fn least_permissive(self, other: Permission) -> Permission {
        if other.level() < self.level() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Permission {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| AccessError::UnknownPermission(s.to_string()))
    }
}

/// One grant of a permission to a user on a workspace
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub workspace_id: WorkspaceId,
    pub user_id: UserId,
    pub permission: Permission,
}

/// Supplies the permission a user holds on a workspace.
#[async_trait]
pub trait Authorization: Send + Sync {
    async fn permission_level(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
    ) -> Option<Permission>;
}

/// In-memory access control list.
///
/// Entries are unique per `(workspace, user)`. A workspace may also carry a
/// default permission (the course or unit default); a user's effective
/// permission is the most permissive of their own entry and that default.
#[derive(Default)]
pub struct InMemoryAcl {
    entries: RwLock<HashMap<(WorkspaceId, UserId), Permission>>,
    defaults: RwLock<HashMap<WorkspaceId, Permission>>,
}

impl InMemoryAcl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant or replace a user's permission. Returns the previous one.
    pub async fn grant(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
        permission: Permission,
    ) -> Option<Permission> {
        self.entries
            .write()
            .await
            .insert((workspace_id, user_id), permission)
    }

    /// Grant by permission name, rejecting names that are not known levels
    pub async fn grant_named(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
        permission: &str,
    ) -> Result<Option<Permission>, AccessError> {
        let permission = permission.parse()?;
        Ok(self.grant(workspace_id, user_id, permission).await)
    }

    pub async fn revoke(&self, workspace_id: WorkspaceId, user_id: UserId) -> bool {
        self.entries
            .write()
            .await
            .remove(&(workspace_id, user_id))
            .is_some()
    }

    /// Drop every entry and the default of a deleted workspace
    pub async fn delete_workspace(&self, workspace_id: WorkspaceId) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(ws, _), _| *ws != workspace_id);
        self.defaults.write().await.remove(&workspace_id);
        before - entries.len()
    }

    pub async fn set_default(&self, workspace_id: WorkspaceId, permission: Option<Permission>) {
        let mut defaults = self.defaults.write().await;
        match permission {
            Some(p) => {
                defaults.insert(workspace_id, p);
            }
            None => {
                defaults.remove(&workspace_id);
            }
        }
    }

    pub async fn entries_for(&self, workspace_id: WorkspaceId) -> Vec<AclEntry> {
        let mut entries: Vec<AclEntry> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|((ws, _), _)| *ws == workspace_id)
            .map(|((ws, user), permission)| AclEntry {
                workspace_id: *ws,
                user_id: *user,
                permission: *permission,
            })
            .collect();
        entries.sort_by_key(|e| e.user_id);
        entries
    }
}

#[async_trait]
impl Authorization for InMemoryAcl {
    async fn permission_level(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
    ) -> Option<Permission> {
        let explicit = self
            .entries
            .read()
            .await
            .get(&(workspace_id, user_id))
            .copied();
        let default = self.defaults.read().await.get(&workspace_id).copied();

        match (explicit, default) {
            (Some(a), Some(b)) => Some(a.most_permissive(b)),
            (a, b) => a.or(b),
        }
    }
}
