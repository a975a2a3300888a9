//! Logical clocks for replicated state
//!
//! Every write is stamped with a `(counter, replica)` pair drawn from a Lamport
//! clock. Stamps are totally ordered, which gives last-writer-wins registers a
//! deterministic winner and gives every set insertion a unique dot.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DocumentError;

/// Largest counter accepted from a remote replica or a stored document.
/// Leaves room for local ticks after observing it.
pub const MAX_COUNTER: u64 = u64::MAX >> 1;

/// Unique identifier for a replica of a document
pub type ReplicaId = Uuid;

/// A point in logical time, unique per replica.
///
/// Ordering compares the counter first and falls back to the replica id, so two
/// replicas that happen to reach the same counter still produce a total order
/// that every peer agrees on regardless of arrival order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub counter: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(counter: u64, replica: ReplicaId) -> Self {
        Self { counter, replica }
    }
}

/// Lamport clock owned by a single replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    replica: ReplicaId,
    counter: u64,
}

impl LamportClock {
    /// Create a clock that has not ticked yet
    pub fn new(replica: ReplicaId) -> Self {
        Self { replica, counter: 0 }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Highest counter this clock has produced or observed
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Advance and return a fresh stamp for a local write
    pub fn tick(&mut self) -> Result<Stamp, DocumentError> {
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| DocumentError::Validation("logical clock exhausted".into()))?;
        Ok(Stamp::new(self.counter, self.replica))
    }

    /// Record a counter seen on a remote write. Never goes backwards.
    pub fn observe(&mut self, counter: u64) {
        if counter > self.counter {
            self.counter = counter;
        }
    }
}
