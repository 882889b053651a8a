use super::Operation;
use crate::core::{OpId, StateVector};
use std::collections::BTreeMap;

/// Every operation this replica has seen, local or remote.
///
/// The state vector only advances over contiguous counters, so an operation
/// that arrives ahead of a gap is stored but not yet summarized.
#[derive(Debug, Clone, Default)]
pub struct OpLog {
    ops: BTreeMap<OpId, Operation>,
    vector: StateVector,
}

impl OpLog {
    pub fn new() -> Self {
        Self {
            ops: BTreeMap::new(),
            vector: StateVector::new(),
        }
    }

    /// Records an operation. Returns `false` if it was already known.
    pub fn insert(&mut self, op: Operation) -> bool {
        let id = op.id();
        if self.ops.contains_key(&id) {
            return false;
        }
        self.ops.insert(id, op);

        let mut next = self.vector.counter(id.replica) + 1;
        while self.ops.contains_key(&OpId::new(id.replica, next)) {
            next += 1;
        }
        if next - 1 > self.vector.counter(id.replica) {
            self.vector.set(id.replica, next - 1);
        }
        true
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.ops.contains_key(id)
    }

    pub fn get(&self, id: &OpId) -> Option<&Operation> {
        self.ops.get(id)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Get the state vector representing all contiguous operations
    pub fn state_vector(&self) -> &StateVector {
        &self.vector
    }

    /// Operations held above the contiguous prefix of their replica.
    pub fn gap_count(&self) -> usize {
        self.ops
            .keys()
            .filter(|id| !self.vector.contains(id))
            .count()
    }

    /// Encode all operations a peer with `since` has not seen
    pub fn missing_for(&self, since: &StateVector) -> Vec<Operation> {
        self.ops
            .iter()
            .filter(|(id, _)| !since.contains(id))
            .map(|(_, op)| op.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.values()
    }
}
