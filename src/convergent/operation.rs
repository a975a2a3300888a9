//! Operations a session can submit against a document

use super::model::{Anchor, GroupId, HighlightId, ScalarField, ScalarValue, TagId};
use crate::access::Permission;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of edits a document accepts.
///
/// Each variant carries only what its merge rule needs. Identifiers are chosen
/// by the caller so a client can refer to what it just created before the
/// server round-trip completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    AddHighlight {
        id: HighlightId,
        start: Anchor,
        end: Anchor,
        tag: TagId,
    },

    /// Remove a highlight (only affects the insertions this replica has seen)
    RemoveHighlight { id: HighlightId },

    /// Create a tag; its order is assigned by the document
    CreateTag {
        id: TagId,
        name: String,
        group: Option<GroupId>,
        color: Option<String>,
    },

    RemoveTag { id: TagId },

    /// Create a tag group; its order is assigned by the document
    CreateGroup {
        id: GroupId,
        name: String,
        color: String,
    },

    RemoveGroup { id: GroupId },

    /// Set a document-level field (latest-wins)
    SetScalar {
        field: ScalarField,
        value: ScalarValue,
    },
}

impl Operation {
    pub fn add_highlight(start: Anchor, end: Anchor, tag: TagId) -> Self {
        Operation::AddHighlight {
            id: Uuid::new_v4(),
            start,
            end,
            tag,
        }
    }

    pub fn remove_highlight(id: HighlightId) -> Self {
        Operation::RemoveHighlight { id }
    }

    pub fn create_tag(name: impl Into<String>, group: Option<GroupId>) -> Self {
        Operation::CreateTag {
            id: Uuid::new_v4(),
            name: name.into(),
            group,
            color: None,
        }
    }

    pub fn create_group(name: impl Into<String>, color: impl Into<String>) -> Self {
        Operation::CreateGroup {
            id: Uuid::new_v4(),
            name: name.into(),
            color: color.into(),
        }
    }

    pub fn set_scalar(field: ScalarField, value: ScalarValue) -> Self {
        Operation::SetScalar { field, value }
    }

    /// Identifier of the record this operation creates or removes
    pub fn target_id(&self) -> Option<Uuid> {
        match self {
            Operation::AddHighlight { id, .. }
            | Operation::RemoveHighlight { id }
            | Operation::CreateTag { id, .. }
            | Operation::RemoveTag { id }
            | Operation::CreateGroup { id, .. }
            | Operation::RemoveGroup { id } => Some(*id),
            Operation::SetScalar { .. } => None,
        }
    }

    /// Least capability a session needs to submit this operation
    pub fn required_permission(&self) -> Permission {
        match self {
            Operation::AddHighlight { .. } | Operation::RemoveHighlight { .. } => {
                Permission::Commenter
            }
            Operation::CreateTag { .. }
            | Operation::RemoveTag { .. }
            | Operation::CreateGroup { .. }
            | Operation::RemoveGroup { .. } => Permission::Peer,
            Operation::SetScalar { field, .. } => field.required_permission(),
        }
    }
}

impl ScalarField {
    /// Sharing overrides are restricted to owners; content edits to editors
    pub fn required_permission(&self) -> Permission {
        match self {
            ScalarField::Title | ScalarField::Paragraphs | ScalarField::AutoNumberParagraphs => {
                Permission::Editor
            }
            ScalarField::SharedWithClass
            | ScalarField::AnonymousSharing
            | ScalarField::CopyProtection => Permission::Owner,
        }
    }
}
