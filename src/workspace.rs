//! Relational projection of a workspace
//!
//! The serialized document stays authoritative; a `WorkspaceRecord` carries
//! the columns a listing or admin view needs without decoding the blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::WorkspaceId;
use crate::convergent::Document;
use crate::resolve::{CourseDefaults, EffectiveSettings, SharingOverrides};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub id: WorkspaceId,
    pub title: String,
    pub sharing: SharingOverrides,
    pub next_tag_order: u64,
    pub next_group_order: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkspaceRecord {
    /// Project a document as first seen at `created_at`
    pub fn from_document(id: WorkspaceId, document: &Document, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title: document.title(),
            sharing: document.sharing_overrides(),
            next_tag_order: document.next_tag_order(),
            next_group_order: document.next_group_order(),
            created_at,
            updated_at: created_at,
        }
    }

    /// Re-project after the document changed. Counters never move backwards.
    pub fn refresh(&mut self, document: &Document, updated_at: DateTime<Utc>) {
        self.title = document.title();
        self.sharing = document.sharing_overrides();
        self.next_tag_order = self.next_tag_order.max(document.next_tag_order());
        self.next_group_order = self.next_group_order.max(document.next_group_order());
        self.updated_at = self.updated_at.max(updated_at);
    }

    pub fn effective_settings(&self, course: &CourseDefaults) -> EffectiveSettings {
        self.sharing.resolve(course)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::{Operation, ScalarField, ScalarValue};
    use crate::resolve::TriState;
    use chrono::Duration;
    use uuid::Uuid;

    #[test]
    fn test_projection_follows_document() {
        let mut doc = Document::new(Uuid::new_v4());
        let created = Utc::now();
        let mut record = WorkspaceRecord::from_document(Uuid::new_v4(), &doc, created);
        assert_eq!(record.title, "");
        assert_eq!(record.next_tag_order, 0);

        doc.apply_local(Operation::set_scalar(
            ScalarField::Title,
            ScalarValue::Text("Response to Rudd".into()),
        ))
        .unwrap();
        doc.apply_local(Operation::set_scalar(
            ScalarField::AnonymousSharing,
            ScalarValue::Override(TriState::On),
        ))
        .unwrap();
        doc.apply_local(Operation::create_tag("claim", None)).unwrap();

        let later = created + Duration::seconds(5);
        record.refresh(&doc, later);
        assert_eq!(record.title, "Response to Rudd");
        assert_eq!(record.next_tag_order, 1);
        assert_eq!(record.updated_at, later);
        assert_eq!(record.created_at, created);

        let course = CourseDefaults {
            shared_with_class: true,
            anonymous_sharing: false,
            copy_protection: false,
        };
        let settings = record.effective_settings(&course);
        assert!(settings.shared_with_class);
        assert!(settings.anonymous_sharing);
    }
}
