//! Convergent annotation documents
//!
//! Replicated state for one workspace: highlights, tags, tag groups,
//! document-level fields and ordering counters. Replicas exchange deltas and
//! converge without coordination.

mod clock;
mod document;
mod lattice;
mod model;
mod operation;

pub use clock::{LamportClock, ReplicaId, Stamp, MAX_COUNTER};
pub use document::{Delta, Document, DocumentSnapshot};
pub use lattice::{Lww, MaxCounter, OrSet};
pub use model::{
    validate_color, Anchor, BlockId, GroupId, Highlight, HighlightId, Paragraph, ParagraphKind,
    ScalarField, ScalarValue, Tag, TagGroup, TagId,
};
pub use operation::Operation;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Corrupt state: {0}")]
    CorruptState(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}
