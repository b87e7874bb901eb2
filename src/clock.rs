//! Vector clocks for causal ordering of canvas operations.
//!
//! Each room keeps one clock; every append increments the author's
//! component and stamps the new operation with a frozen snapshot. Two
//! stamped operations can then be compared:
//!
//! ```text
//! causality(A, B) = Before      every component of A ≤ B, one strictly <
//!                 = After       the mirror image
//!                 = Concurrent  neither dominates (or A == B)
//! ```
//!
//! Concurrent operations are ordered deterministically by wall-clock
//! timestamp (and finally by id) when the log is sorted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// The left clock happens-before the right.
    Before,
    /// The right clock happens-before the left.
    After,
    /// Neither dominates the other (includes equality).
    Concurrent,
}

/// A per-participant counter map.
///
/// Counters are monotone: `increment` and `merge` never lower a component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: HashMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `user_id`'s component by one and return a frozen snapshot of
    /// the whole clock as it stands after the increment.
    pub fn increment(&mut self, user_id: &str) -> VectorClock {
        let counter = self.counters.entry(user_id.to_string()).or_insert(0);
        *counter += 1;
        self.clone()
    }

    /// Component for `user_id`, zero when absent.
    pub fn get(&self, user_id: &str) -> u64 {
        self.counters.get(user_id).copied().unwrap_or(0)
    }

    /// Pointwise maximum with `remote`. Own components never decrease.
    pub fn merge(&mut self, remote: &VectorClock) {
        for (user_id, &count) in &remote.counters {
            let entry = self.counters.entry(user_id.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    /// Compare against `other` over the union of keys.
    pub fn causality(&self, other: &VectorClock) -> Causality {
        let mut less = false;
        let mut greater = false;

        for user_id in self.counters.keys().chain(other.counters.keys()) {
            let a = self.get(user_id);
            let b = other.get(user_id);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
        }

        match (less, greater) {
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            _ => Causality::Concurrent,
        }
    }

    /// Number of participants with a non-zero component.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Whether every component of `other` is ≤ the matching component here.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .counters
            .iter()
            .all(|(user_id, &count)| self.get(user_id) >= count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_returns_snapshot() {
        let mut clock = VectorClock::new();
        let snap1 = clock.increment("a");
        let snap2 = clock.increment("a");

        assert_eq!(snap1.get("a"), 1);
        assert_eq!(snap2.get("a"), 2);
        // Snapshots are frozen: incrementing further does not touch them.
        clock.increment("a");
        assert_eq!(snap1.get("a"), 1);
    }

    #[test]
    fn test_increment_single_component() {
        let mut clock = VectorClock::new();
        clock.increment("a");
        clock.increment("b");
        let before = clock.clone();
        clock.increment("a");

        // Exactly one component moved, by exactly one.
        assert_eq!(clock.get("a"), before.get("a") + 1);
        assert_eq!(clock.get("b"), before.get("b"));
    }

    #[test]
    fn test_merge_takes_pointwise_max() {
        let mut a = VectorClock::new();
        a.increment("x");
        a.increment("x");
        a.increment("y");

        let mut b = VectorClock::new();
        b.increment("x");
        b.increment("z");

        a.merge(&b);
        assert_eq!(a.get("x"), 2);
        assert_eq!(a.get("y"), 1);
        assert_eq!(a.get("z"), 1);
    }

    #[test]
    fn test_merge_never_lowers() {
        let mut a = VectorClock::new();
        a.increment("x");
        a.increment("x");

        let empty = VectorClock::new();
        a.merge(&empty);
        assert_eq!(a.get("x"), 2);
    }

    #[test]
    fn test_causality_before_after() {
        let mut a = VectorClock::new();
        a.increment("x");

        let mut b = a.clone();
        b.increment("x");

        assert_eq!(a.causality(&b), Causality::Before);
        assert_eq!(b.causality(&a), Causality::After);
    }

    #[test]
    fn test_causality_concurrent() {
        let mut a = VectorClock::new();
        a.increment("x");

        let mut b = VectorClock::new();
        b.increment("y");

        assert_eq!(a.causality(&b), Causality::Concurrent);
        assert_eq!(b.causality(&a), Causality::Concurrent);
    }

    #[test]
    fn test_causality_irreflexive() {
        let mut a = VectorClock::new();
        a.increment("x");
        a.increment("y");
        // A clock never happens-before itself.
        assert_eq!(a.causality(&a), Causality::Concurrent);
    }

    #[test]
    fn test_causality_antisymmetric() {
        let mut a = VectorClock::new();
        a.increment("x");
        let mut b = a.clone();
        b.increment("y");

        assert_eq!(a.causality(&b), Causality::Before);
        assert_ne!(b.causality(&a), Causality::Before);
    }

    #[test]
    fn test_causality_transitive() {
        let mut a = VectorClock::new();
        a.increment("x");
        let mut b = a.clone();
        b.increment("y");
        let mut c = b.clone();
        c.increment("z");

        assert_eq!(a.causality(&b), Causality::Before);
        assert_eq!(b.causality(&c), Causality::Before);
        assert_eq!(a.causality(&c), Causality::Before);
    }

    #[test]
    fn test_dominates() {
        let mut room = VectorClock::new();
        let op1 = room.increment("a");
        let op2 = room.increment("b");

        assert!(op2.dominates(&op1));
        assert!(room.dominates(&op1));
        assert!(room.dominates(&op2));
        assert!(!op1.dominates(&op2));
    }

    #[test]
    fn test_empty_clock() {
        let clock = VectorClock::new();
        assert!(clock.is_empty());
        assert_eq!(clock.len(), 0);
        assert_eq!(clock.get("anyone"), 0);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut clock = VectorClock::new();
        clock.increment("a");
        clock.increment("b");
        clock.increment("b");

        let bytes =
            bincode::serde::encode_to_vec(&clock, bincode::config::standard()).unwrap();
        let (decoded, _): (VectorClock, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, clock);
    }
}
