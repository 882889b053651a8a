//! Core CRDT algorithms for collaborative text.
//!
//! This module provides the building blocks every other layer relies on:
//!
//! - [`OpId`] - Unique operation identifiers, totally ordered by `(counter, replica)`
//! - [`StateVector`] - Highest contiguous counter seen per replica
//! - [`IdAllocator`] - Per-replica monotonic id source
//! - [`Sequence`] - YATA-style ordered sequence with tombstones

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod sequence;

pub use sequence::{
    ApplyOutcome, Element, IndexError, MergeError, Sequence, SequenceOp, VisibleChange,
};

pub type ReplicaId = u64;

/// Generates a fresh replica id for a new session.
pub fn random_replica_id() -> ReplicaId {
    let (high, low) = Uuid::new_v4().as_u64_pair();
    // Zero is reserved so a default-constructed id never collides with a live replica.
    (high ^ low).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub replica: ReplicaId,
}

impl OpId {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { counter, replica }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:x}", self.counter, self.replica)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    replicas: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self {
            replicas: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn get(&self, replica: ReplicaId) -> Option<u64> {
        self.replicas.get(&replica).copied()
    }

    /// Counter seen for `replica`, zero when the replica is unknown.
    pub fn counter(&self, replica: ReplicaId) -> u64 {
        self.get(replica).unwrap_or(0)
    }

    pub fn set(&mut self, replica: ReplicaId, counter: u64) {
        self.replicas.insert(replica, counter);
    }

    /// Raises the entry for `replica` to `counter`; never lowers it.
    pub fn advance(&mut self, replica: ReplicaId, counter: u64) {
        let entry = self.replicas.entry(replica).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    pub fn contains(&self, id: &OpId) -> bool {
        id.counter <= self.counter(id.replica)
    }

    /// True when every entry of `other` is covered by `self`.
    pub fn covers(&self, other: &StateVector) -> bool {
        other
            .replicas
            .iter()
            .all(|(replica, counter)| self.counter(*replica) >= *counter)
    }

    /// Pointwise maximum of both vectors.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, counter) in &other.replicas {
            self.advance(*replica, *counter);
        }
    }

    /// Total number of operations summarized by this vector.
    pub fn total(&self) -> u64 {
        self.replicas.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.replicas
            .iter()
            .map(|(replica, counter)| (*replica, *counter))
    }
}

/// Allocates operation ids for one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdAllocator {
    replica: ReplicaId,
    counter: u64,
}

impl IdAllocator {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            counter: 0,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Last counter handed out, zero before the first allocation.
    pub fn current(&self) -> u64 {
        self.counter
    }

    pub fn next_id(&mut self) -> OpId {
        self.counter += 1;
        OpId {
            counter: self.counter,
            replica: self.replica,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_starts_at_one() {
        let mut alloc = IdAllocator::new(7);
        assert_eq!(alloc.current(), 0);
        assert_eq!(alloc.next_id(), OpId::new(7, 1));
        assert_eq!(alloc.next_id(), OpId::new(7, 2));
        assert_eq!(alloc.current(), 2);
    }

    #[test]
    fn test_state_vector_advance_never_lowers() {
        let mut sv = StateVector::new();
        sv.advance(1, 5);
        sv.advance(1, 3);
        assert_eq!(sv.get(1), Some(5));
        assert!(sv.contains(&OpId::new(1, 5)));
        assert!(!sv.contains(&OpId::new(1, 6)));
    }

    #[test]
    fn test_state_vector_covers_and_merge() {
        let mut a = StateVector::new();
        a.set(1, 4);
        let mut b = StateVector::new();
        b.set(1, 2);
        b.set(2, 1);

        assert!(!a.covers(&b));
        a.merge(&b);
        assert!(a.covers(&b));
        assert_eq!(a.total(), 5);
    }

    #[test]
    fn test_random_replica_id_nonzero() {
        assert_ne!(random_replica_id(), 0);
    }

    #[test]
    fn test_state_vector_json_round_trip() {
        let mut sv = StateVector::new();
        sv.set(42, 9);
        let json = serde_json::to_string(&sv).unwrap();
        let back: StateVector = serde_json::from_str(&json).unwrap();
        assert_eq!(sv, back);
    }
}
