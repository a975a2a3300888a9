//! Join-semilattice building blocks
//!
//! Each structure here merges with `join`, which is commutative, associative
//! and idempotent. `join` reports whether the *visible* value changed, so
//! callers can skip broadcasting no-op merges.

use super::clock::Stamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Observed-remove set with add-wins semantics.
///
/// Every insertion carries a unique dot. A remove tombstones exactly the dots
/// it observed, so an insertion the remover never saw keeps the element alive.
/// A dot that is already tombstoned is never revived, which makes a late copy
/// of an already-deleted insertion a no-op.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrSet<K: Ord, V> {
    adds: BTreeMap<Stamp, (K, V)>,
    removed: BTreeSet<Stamp>,
}

impl<K: Ord, V> Default for OrSet<K, V> {
    fn default() -> Self {
        Self {
            adds: BTreeMap::new(),
            removed: BTreeSet::new(),
        }
    }
}

impl<K, V> OrSet<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding only one insertion, used as a delta
    pub fn singleton(dot: Stamp, key: K, value: V) -> Self {
        let mut set = Self::new();
        set.adds.insert(dot, (key, value));
        set
    }

    /// A set holding only tombstones, used as a delta
    pub fn tombstones(dots: impl IntoIterator<Item = Stamp>) -> Self {
        Self {
            adds: BTreeMap::new(),
            removed: dots.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removed.is_empty()
    }

    /// Insert under a fresh dot. Returns false if the dot was already tombstoned.
    pub fn insert(&mut self, dot: Stamp, key: K, value: V) -> bool {
        if self.removed.contains(&dot) {
            return false;
        }
        self.adds.insert(dot, (key, value));
        true
    }

    /// Tombstone every live dot of `key`, returning the dots removed
    pub fn remove(&mut self, key: &K) -> Vec<Stamp> {
        let dots: Vec<Stamp> = self
            .adds
            .iter()
            .filter(|(_, (k, _))| k == key)
            .map(|(dot, _)| *dot)
            .collect();
        for dot in &dots {
            self.adds.remove(dot);
            self.removed.insert(*dot);
        }
        dots
    }

    /// Current value of `key`: the one carried by its highest live dot
    pub fn get(&self, key: &K) -> Option<&V> {
        self.adds
            .iter()
            .rev()
            .find(|(_, (k, _))| k == key)
            .map(|(_, (_, v))| v)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Visible elements, one per key
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let mut visible: BTreeMap<&K, &V> = BTreeMap::new();
        // Ascending dot order, so the highest dot of each key is written last
        for (k, v) in self.adds.values() {
            visible.insert(k, v);
        }
        visible.into_iter()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Every element carried by this set, live or not. Used for validation.
    pub fn raw_values(&self) -> impl Iterator<Item = &V> {
        self.adds.values().map(|(_, v)| v)
    }

    pub fn max_counter(&self) -> u64 {
        let add_max = self.adds.keys().next_back().map(|s| s.counter).unwrap_or(0);
        let rem_max = self.removed.iter().map(|s| s.counter).max().unwrap_or(0);
        add_max.max(rem_max)
    }

    pub fn join(&mut self, other: &Self) -> bool {
        let touched = self.touched_keys(other);
        let before: Vec<Option<V>> = touched.iter().map(|k| self.get(k).cloned()).collect();

        for dot in &other.removed {
            self.adds.remove(dot);
            self.removed.insert(*dot);
        }
        for (dot, (key, value)) in &other.adds {
            if !self.removed.contains(dot) {
                self.adds
                    .entry(*dot)
                    .or_insert_with(|| (key.clone(), value.clone()));
            }
        }

        touched
            .iter()
            .zip(before)
            .any(|(k, old)| self.get(k) != old.as_ref())
    }

    fn touched_keys(&self, other: &Self) -> BTreeSet<K> {
        let mut keys: BTreeSet<K> = other.adds.values().map(|(k, _)| k.clone()).collect();
        for dot in &other.removed {
            if let Some((k, _)) = self.adds.get(dot) {
                keys.insert(k.clone());
            }
        }
        keys
    }
}

/// Last-writer-wins register
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lww<T> {
    pub value: T,
    pub stamp: Stamp,
}

impl<T: Clone + PartialEq> Lww<T> {
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }

    pub fn join(&mut self, other: &Self) -> bool {
        if other.stamp > self.stamp {
            let changed = other.value != self.value;
            self.value = other.value.clone();
            self.stamp = other.stamp;
            changed
        } else {
            false
        }
    }
}

/// Grow-only counter that merges by taking the maximum
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MaxCounter(u64);

impl MaxCounter {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Hand out the current value and advance past it. None once exhausted.
    pub fn take_next(&mut self) -> Option<u64> {
        let value = self.0;
        self.0 = value.checked_add(1)?;
        Some(value)
    }

    pub fn join(&mut self, other: &Self) -> bool {
        if other.0 > self.0 {
            self.0 = other.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn dot(counter: u64, replica: u128) -> Stamp {
        Stamp::new(counter, Uuid::from_u128(replica))
    }

    #[test]
    fn test_concurrent_add_survives_remove() {
        let mut a: OrSet<&str, i32> = OrSet::new();
        a.insert(dot(1, 1), "x", 10);
        let mut b = a.clone();

        // A removes what it saw, B re-adds concurrently
        let removed = a.remove(&"x");
        assert_eq!(removed, vec![dot(1, 1)]);
        b.insert(dot(2, 2), "x", 20);

        let mut merged_ab = a.clone();
        merged_ab.join(&b);
        let mut merged_ba = b.clone();
        merged_ba.join(&a);

        assert_eq!(merged_ab.get(&"x"), Some(&20));
        assert_eq!(merged_ab, merged_ba);
    }

    #[test]
    fn test_tombstoned_dot_is_never_revived() {
        let add = OrSet::singleton(dot(1, 1), "x", 1);
        let mut set = OrSet::tombstones([dot(1, 1)]);

        assert!(!set.join(&add));
        assert!(!set.contains(&"x"));
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut set: OrSet<&str, i32> = OrSet::new();
        let delta = OrSet::singleton(dot(1, 1), "x", 1);

        assert!(set.join(&delta));
        let snapshot = set.clone();
        assert!(!set.join(&delta));
        assert_eq!(set, snapshot);
    }

    #[test]
    fn test_highest_dot_wins_for_duplicate_key() {
        let mut set: OrSet<&str, &str> = OrSet::new();
        set.insert(dot(3, 1), "x", "late");
        set.insert(dot(2, 2), "x", "early");

        assert_eq!(set.get(&"x"), Some(&"late"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_lww_join_keeps_highest_stamp() {
        let mut reg = Lww::new("a", dot(1, 1));
        assert!(reg.join(&Lww::new("b", dot(2, 1))));
        assert!(!reg.join(&Lww::new("c", dot(1, 9))));
        assert_eq!(reg.value, "b");

        // Newer stamp with the same value is not a visible change
        assert!(!reg.join(&Lww::new("b", dot(3, 1))));
        assert_eq!(reg.stamp, dot(3, 1));
    }

    #[test]
    fn test_max_counter() {
        let mut counter = MaxCounter::default();
        assert_eq!(counter.take_next(), Some(0));
        assert_eq!(counter.take_next(), Some(1));

        assert!(!counter.join(&MaxCounter::new(1)));
        assert!(counter.join(&MaxCounter::new(7)));
        assert_eq!(counter.value(), 7);

        let mut full = MaxCounter::new(u64::MAX);
        assert_eq!(full.take_next(), None);
        assert_eq!(full.value(), u64::MAX);
    }
}
