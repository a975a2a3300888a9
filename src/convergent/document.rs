//! The replicated annotation document
//!
//! A `Document` is a state-based CRDT. Local operations mutate it in place and
//! return a `Delta`: a fragment of the same replicated state holding only what
//! changed. Merging is a lattice join, so deltas can be applied in any order,
//! any number of times, and every replica that has seen the same deltas ends
//! up with the same state.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::clock::{LamportClock, ReplicaId, MAX_COUNTER};
use super::lattice::{Lww, MaxCounter, OrSet};
use super::model::{
    BlockId, GroupId, Highlight, HighlightId, Paragraph, ParagraphKind, ScalarField, ScalarValue,
    Tag, TagGroup, TagId,
};
use super::operation::Operation;
use super::DocumentError;
use crate::access::Permission;
use crate::resolve::{CourseDefaults, EffectiveSettings, OrderKey, SharingOverrides, TriState};

/// Version tag written at the front of every persisted blob
const FORMAT_VERSION: u8 = 1;

fn cbor_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, DocumentError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| DocumentError::Encoding(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T, DocumentError> {
    ciborium::from_reader(data).map_err(|e| DocumentError::CorruptState(e.to_string()))
}

fn check_counter(what: &str, value: u64) -> Result<(), DocumentError> {
    if value > MAX_COUNTER {
        return Err(DocumentError::Validation(format!(
            "{} counter {} is out of range",
            what, value
        )));
    }
    Ok(())
}

fn order_exhausted() -> DocumentError {
    DocumentError::Validation("order counter exhausted".into())
}

/// Everything that replicates. Shared by documents and deltas.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct ReplicatedState {
    highlights: OrSet<HighlightId, Highlight>,
    tags: OrSet<TagId, Tag>,
    groups: OrSet<GroupId, TagGroup>,
    scalars: BTreeMap<ScalarField, Lww<ScalarValue>>,
    next_tag_order: MaxCounter,
    next_group_order: MaxCounter,
}

impl ReplicatedState {
    fn join(&mut self, other: &ReplicatedState) -> bool {
        let mut changed = self.highlights.join(&other.highlights);
        changed |= self.tags.join(&other.tags);
        changed |= self.groups.join(&other.groups);
        changed |= self.next_tag_order.join(&other.next_tag_order);
        changed |= self.next_group_order.join(&other.next_group_order);

        for (field, register) in &other.scalars {
            match self.scalars.get_mut(field) {
                Some(mine) => changed |= mine.join(register),
                None => {
                    changed |= register.value != field.default_value();
                    self.scalars.insert(*field, register.clone());
                }
            }
        }
        changed
    }

    /// Check every record carried, live or tombstoned-later, before any write
    fn validate(&self) -> Result<(), DocumentError> {
        for highlight in self.highlights.raw_values() {
            highlight.validate()?;
        }
        for tag in self.tags.raw_values() {
            tag.validate()?;
        }
        for group in self.groups.raw_values() {
            group.validate()?;
        }
        for (field, register) in &self.scalars {
            field.validate(&register.value)?;
        }
        check_counter("stamp", self.max_counter())?;
        check_counter("tag order", self.next_tag_order.value())?;
        check_counter("group order", self.next_group_order.value())?;
        Ok(())
    }

    fn max_counter(&self) -> u64 {
        let scalar_max = self
            .scalars
            .values()
            .map(|r| r.stamp.counter)
            .max()
            .unwrap_or(0);
        self.highlights
            .max_counter()
            .max(self.tags.max_counter())
            .max(self.groups.max_counter())
            .max(scalar_max)
    }

    fn is_empty(&self) -> bool {
        self.highlights.is_empty()
            && self.tags.is_empty()
            && self.groups.is_empty()
            && self.scalars.is_empty()
            && self.next_tag_order.value() == 0
            && self.next_group_order.value() == 0
    }

    fn scalar(&self, field: ScalarField) -> ScalarValue {
        self.scalars
            .get(&field)
            .map(|r| r.value.clone())
            .unwrap_or_else(|| field.default_value())
    }
}

impl ScalarField {
    /// Value a field has before anyone writes it
    pub fn default_value(&self) -> ScalarValue {
        match self {
            ScalarField::Title => ScalarValue::Text(String::new()),
            ScalarField::Paragraphs => ScalarValue::Paragraphs(Vec::new()),
            ScalarField::AutoNumberParagraphs => ScalarValue::Flag(true),
            ScalarField::SharedWithClass
            | ScalarField::AnonymousSharing
            | ScalarField::CopyProtection => ScalarValue::Override(TriState::Inherit),
        }
    }
}

/// The change produced by one local operation, for broadcast to peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    origin: ReplicaId,
    state: ReplicatedState,
}

impl Delta {
    fn new(origin: ReplicaId) -> Self {
        Self {
            origin,
            state: ReplicatedState::default(),
        }
    }

    /// Replica that produced this delta, or the session that relayed it.
    ///
    /// Informational only: merging never looks at it, and the stamps inside
    /// carry their own replica ids.
    pub fn origin(&self) -> ReplicaId {
        self.origin
    }

    /// Re-label a client delta with the id of whoever is relaying it
    pub(crate) fn relayed_from(mut self, origin: ReplicaId) -> Self {
        self.origin = origin;
        self
    }

    /// True when merging this delta cannot change anything
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, DocumentError> {
        cbor_serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DocumentError> {
        cbor_deserialize(data)
    }

    /// Least capability needed to apply everything this delta carries
    pub fn required_permission(&self) -> Permission {
        let mut required = Permission::Viewer;
        if !self.state.highlights.is_empty() {
            required = required.most_permissive(Permission::Commenter);
        }
        if !self.state.tags.is_empty()
            || !self.state.groups.is_empty()
            || self.state.next_tag_order.value() > 0
            || self.state.next_group_order.value() > 0
        {
            required = required.most_permissive(Permission::Peer);
        }
        for field in self.state.scalars.keys() {
            required = required.most_permissive(field.required_permission());
        }
        required
    }
}

/// Read-only resolved view of a document, for initial render and export.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub title: String,
    pub paragraphs: Vec<Paragraph>,
    pub auto_number_paragraphs: bool,
    pub sharing: SharingOverrides,
    /// Visible highlights in reading order
    pub highlights: Vec<Highlight>,
    /// Tags in stable creation order; references to removed groups are cleared
    pub tags: Vec<Tag>,
    pub groups: Vec<TagGroup>,
    pub paragraph_numbers: BTreeMap<BlockId, u32>,
    pub next_tag_order: u64,
    pub next_group_order: u64,
}

#[derive(Serialize)]
struct StoredRef<'a> {
    version: u8,
    clock: &'a LamportClock,
    state: &'a ReplicatedState,
}

#[derive(Deserialize)]
struct Stored {
    version: u8,
    clock: LamportClock,
    state: ReplicatedState,
}

/// A replica of one workspace's annotations
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    clock: LamportClock,
    state: ReplicatedState,
}

impl Document {
    /// Create an empty document owned by `replica`
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            clock: LamportClock::new(replica),
            state: ReplicatedState::default(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.clock.replica()
    }

    /// Validate and apply a local operation, returning the delta to broadcast
    pub fn apply_local(&mut self, op: Operation) -> Result<Delta, DocumentError> {
        let mut delta = Delta::new(self.replica());

        match op {
            Operation::AddHighlight {
                id,
                start,
                end,
                tag,
            } => {
                let highlight = Highlight {
                    id,
                    start,
                    end,
                    tag,
                };
                highlight.validate()?;
                let dot = self.clock.tick()?;
                self.state.highlights.insert(dot, id, highlight.clone());
                delta.state.highlights = OrSet::singleton(dot, id, highlight);
            }
            Operation::RemoveHighlight { id } => {
                let dots = self.state.highlights.remove(&id);
                delta.state.highlights = OrSet::tombstones(dots);
            }
            Operation::CreateTag {
                id,
                name,
                group,
                color,
            } => {
                let mut tag = Tag {
                    id,
                    name,
                    group,
                    color,
                    order: 0,
                    created_at: Utc::now(),
                };
                tag.validate()?;
                let dot = self.clock.tick()?;
                tag.order = self
                    .state
                    .next_tag_order
                    .take_next()
                    .ok_or_else(order_exhausted)?;
                self.state.tags.insert(dot, id, tag.clone());
                delta.state.tags = OrSet::singleton(dot, id, tag);
                delta.state.next_tag_order = self.state.next_tag_order;
            }
            Operation::RemoveTag { id } => {
                let dots = self.state.tags.remove(&id);
                delta.state.tags = OrSet::tombstones(dots);
            }
            Operation::CreateGroup { id, name, color } => {
                let mut group = TagGroup {
                    id,
                    name,
                    color,
                    order: 0,
                    created_at: Utc::now(),
                };
                group.validate()?;
                let dot = self.clock.tick()?;
                group.order = self
                    .state
                    .next_group_order
                    .take_next()
                    .ok_or_else(order_exhausted)?;
                self.state.groups.insert(dot, id, group.clone());
                delta.state.groups = OrSet::singleton(dot, id, group);
                delta.state.next_group_order = self.state.next_group_order;
            }
            Operation::RemoveGroup { id } => {
                let dots = self.state.groups.remove(&id);
                delta.state.groups = OrSet::tombstones(dots);
            }
            Operation::SetScalar { field, value } => {
                field.validate(&value)?;
                let register = Lww::new(value, self.clock.tick()?);
                self.state.scalars.insert(field, register.clone());
                delta.state.scalars.insert(field, register);
            }
        }

        Ok(delta)
    }

    /// Merge a delta from any replica. Returns whether visible state changed.
    ///
    /// A delta that fails validation is rejected whole; nothing is applied.
    pub fn merge_remote(&mut self, delta: &Delta) -> Result<bool, DocumentError> {
        delta.state.validate()?;
        self.clock.observe(delta.state.max_counter());
        Ok(self.state.join(&delta.state))
    }

    /// The whole replicated state as a delta, for full reconciliation
    pub fn full_delta(&self) -> Delta {
        Delta {
            origin: self.replica(),
            state: self.state.clone(),
        }
    }

    /// Copy of this document that stamps its own edits as `replica`
    pub fn fork(&self, replica: ReplicaId) -> Document {
        let mut clock = LamportClock::new(replica);
        clock.observe(self.clock.counter());
        Self {
            clock,
            state: self.state.clone(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, DocumentError> {
        cbor_serialize(&StoredRef {
            version: FORMAT_VERSION,
            clock: &self.clock,
            state: &self.state,
        })
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DocumentError> {
        let stored: Stored = cbor_deserialize(data)?;
        if stored.version != FORMAT_VERSION {
            return Err(DocumentError::CorruptState(format!(
                "unsupported format version {}",
                stored.version
            )));
        }
        stored
            .state
            .validate()
            .and_then(|_| check_counter("clock", stored.clock.counter()))
            .map_err(|e| {
                DocumentError::CorruptState(format!("persisted state is invalid: {}", e))
            })?;
        Ok(Self {
            clock: stored.clock,
            state: stored.state,
        })
    }

    /// True if both replicas hold identical replicated state
    pub fn converged_with(&self, other: &Document) -> bool {
        self.state == other.state
    }

    pub fn highlight(&self, id: &HighlightId) -> Option<&Highlight> {
        self.state.highlights.get(id)
    }

    pub fn highlights(&self) -> impl Iterator<Item = &Highlight> {
        self.state.highlights.iter().map(|(_, h)| h)
    }

    pub fn tag(&self, id: &TagId) -> Option<&Tag> {
        self.state.tags.get(id)
    }

    /// Tags in stable order
    pub fn tags(&self) -> Vec<&Tag> {
        let mut tags: Vec<&Tag> = self.state.tags.iter().map(|(_, t)| t).collect();
        tags.sort_by_key(|t| OrderKey::new(t.order, t.created_at, t.id));
        tags
    }

    pub fn group(&self, id: &GroupId) -> Option<&TagGroup> {
        self.state.groups.get(id)
    }

    /// Tag groups in stable order
    pub fn groups(&self) -> Vec<&TagGroup> {
        let mut groups: Vec<&TagGroup> = self.state.groups.iter().map(|(_, g)| g).collect();
        groups.sort_by_key(|g| OrderKey::new(g.order, g.created_at, g.id));
        groups
    }

    pub fn next_tag_order(&self) -> u64 {
        self.state.next_tag_order.value()
    }

    pub fn next_group_order(&self) -> u64 {
        self.state.next_group_order.value()
    }

    pub fn title(&self) -> String {
        match self.state.scalar(ScalarField::Title) {
            ScalarValue::Text(title) => title,
            _ => String::new(),
        }
    }

    pub fn paragraphs(&self) -> Vec<Paragraph> {
        match self.state.scalar(ScalarField::Paragraphs) {
            ScalarValue::Paragraphs(paragraphs) => paragraphs,
            _ => Vec::new(),
        }
    }

    pub fn auto_number_paragraphs(&self) -> bool {
        matches!(
            self.state.scalar(ScalarField::AutoNumberParagraphs),
            ScalarValue::Flag(true)
        )
    }

    pub fn sharing_overrides(&self) -> SharingOverrides {
        let tri = |field| match self.state.scalar(field) {
            ScalarValue::Override(value) => value,
            _ => TriState::Inherit,
        };
        SharingOverrides {
            shared_with_class: tri(ScalarField::SharedWithClass),
            anonymous_sharing: tri(ScalarField::AnonymousSharing),
            copy_protection: tri(ScalarField::CopyProtection),
        }
    }

    pub fn effective_settings(&self, course: &CourseDefaults) -> EffectiveSettings {
        self.sharing_overrides().resolve(course)
    }

    /// Paragraph numbering, derived from content on every read.
    ///
    /// With auto-numbering on, non-empty body paragraphs are numbered from 1.
    /// Otherwise only paragraphs carrying an explicit number are numbered.
    pub fn paragraph_map(&self) -> BTreeMap<BlockId, u32> {
        let auto = self.auto_number_paragraphs();
        let mut numbers = BTreeMap::new();
        let mut next = 1;

        for paragraph in self.paragraphs() {
            if paragraph.kind != ParagraphKind::Body {
                continue;
            }
            if auto {
                if !paragraph.text.trim().is_empty() {
                    numbers.insert(paragraph.id, next);
                    next += 1;
                }
            } else if let Some(n) = paragraph.explicit_number() {
                numbers.insert(paragraph.id, n);
            }
        }
        numbers
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        let paragraphs = self.paragraphs();
        let position: HashMap<BlockId, usize> = paragraphs
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id, i))
            .collect();
        let reading_order = |h: &Highlight| {
            (
                position.get(&h.start.block).copied().unwrap_or(usize::MAX),
                h.start.offset,
                position.get(&h.end.block).copied().unwrap_or(usize::MAX),
                h.end.offset,
                h.id,
            )
        };

        let mut highlights: Vec<Highlight> = self.highlights().cloned().collect();
        highlights.sort_by_key(|h| reading_order(h));

        let tags = self
            .tags()
            .into_iter()
            .map(|t| {
                let mut tag = t.clone();
                if tag.group.map_or(false, |g| !self.state.groups.contains(&g)) {
                    tag.group = None;
                }
                tag
            })
            .collect();

        DocumentSnapshot {
            title: self.title(),
            auto_number_paragraphs: self.auto_number_paragraphs(),
            sharing: self.sharing_overrides(),
            highlights,
            tags,
            groups: self.groups().into_iter().cloned().collect(),
            paragraph_numbers: self.paragraph_map(),
            next_tag_order: self.next_tag_order(),
            next_group_order: self.next_group_order(),
            paragraphs,
        }
    }

    /// SHA-256 of the resolved snapshot, hex encoded
    pub fn digest(&self) -> Result<String, DocumentError> {
        let encoded = cbor_serialize(&self.snapshot())?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }
}
