//! Cascading settings and stable ordering
//!
//! Activity-level settings (sharing, anonymity, copy protection) are tri-state
//! overrides on top of a course default. Tags and groups are ordered by the
//! counter value they were created with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An override that may be left unset to inherit a broader default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriState {
    #[default]
    Inherit,
    On,
    Off,
}

impl TriState {
    /// Resolve against the course default
    pub fn resolve(self, course_default: bool) -> bool {
        resolve_tristate(self.into(), course_default)
    }

    pub fn is_set(self) -> bool {
        self != TriState::Inherit
    }
}

impl From<Option<bool>> for TriState {
    fn from(value: Option<bool>) -> Self {
        match value {
            None => TriState::Inherit,
            Some(true) => TriState::On,
            Some(false) => TriState::Off,
        }
    }
}

impl From<TriState> for Option<bool> {
    fn from(value: TriState) -> Self {
        match value {
            TriState::Inherit => None,
            TriState::On => Some(true),
            TriState::Off => Some(false),
        }
    }
}

/// The override wins whenever it is set; otherwise the course default applies.
pub fn resolve_tristate(override_value: Option<bool>, course_default: bool) -> bool {
    override_value.unwrap_or(course_default)
}

/// Course-level defaults an activity inherits from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseDefaults {
    pub shared_with_class: bool,
    pub anonymous_sharing: bool,
    pub copy_protection: bool,
}

/// Settings after applying activity overrides to course defaults
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveSettings {
    pub shared_with_class: bool,
    pub anonymous_sharing: bool,
    pub copy_protection: bool,
}

/// Activity overrides as stored on a workspace document
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingOverrides {
    pub shared_with_class: TriState,
    pub anonymous_sharing: TriState,
    pub copy_protection: TriState,
}

impl SharingOverrides {
    pub fn resolve(&self, course: &CourseDefaults) -> EffectiveSettings {
        EffectiveSettings {
            shared_with_class: self.shared_with_class.resolve(course.shared_with_class),
            anonymous_sharing: self.anonymous_sharing.resolve(course.anonymous_sharing),
            copy_protection: self.copy_protection.resolve(course.copy_protection),
        }
    }
}

/// Total order for tags and groups.
///
/// Two replicas can hand out the same counter value concurrently; the creation
/// time and then the identifier break that tie.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub order: u64,
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl OrderKey {
    pub fn new(order: u64, created_at: DateTime<Utc>, id: Uuid) -> Self {
        Self {
            order,
            created_at,
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_tristate_table() {
        assert!(resolve_tristate(None, true));
        assert!(!resolve_tristate(None, false));
        assert!(!resolve_tristate(Some(false), true));
        assert!(resolve_tristate(Some(true), false));
        assert!(resolve_tristate(Some(true), true));
        assert!(!resolve_tristate(Some(false), false));
    }

    #[test]
    fn test_tristate_option_mapping() {
        for value in [None, Some(true), Some(false)] {
            let tri = TriState::from(value);
            assert_eq!(Option::<bool>::from(tri), value);
        }
        assert!(!TriState::Inherit.is_set());
        assert!(TriState::Off.is_set());
    }

    #[test]
    fn test_overrides_resolve_per_field() {
        let course = CourseDefaults {
            shared_with_class: true,
            anonymous_sharing: false,
            copy_protection: true,
        };
        let overrides = SharingOverrides {
            shared_with_class: TriState::Inherit,
            anonymous_sharing: TriState::On,
            copy_protection: TriState::Off,
        };

        let effective = overrides.resolve(&course);
        assert!(effective.shared_with_class);
        assert!(effective.anonymous_sharing);
        assert!(!effective.copy_protection);
    }

    #[test]
    fn test_order_key_tiebreak() {
        let now = Utc::now();
        let later = now + chrono::Duration::milliseconds(5);
        let a = OrderKey::new(3, now, Uuid::from_u128(9));
        let b = OrderKey::new(3, later, Uuid::from_u128(1));
        let c = OrderKey::new(3, later, Uuid::from_u128(2));

        assert!(a < b);
        assert!(b < c);
        assert!(OrderKey::new(2, later, Uuid::from_u128(9)) < a);
    }
}
