//! A naive, slow oracle for differential testing.
//!
//! The oracle never sees operations out of order: [`replay`] sorts the full
//! set of operations into a canonical causal order first and integrates them
//! one by one with linear searches. Whatever order the real sequence received
//! the same operations in, its visible text must match.
use mesh_crdt::core::{OpId, SequenceOp};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Element<T> {
    id: OpId,
    value: T,
    origin_left: Option<OpId>,
    origin_right: Option<OpId>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sequence<T> {
    elements: Vec<Element<T>>,
    deleted: BTreeSet<OpId>,
}

impl<T: Clone> Sequence<T> {
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
            deleted: BTreeSet::new(),
        }
    }

    fn position(&self, id: &OpId) -> Option<usize> {
        self.elements.iter().position(|elem| elem.id == *id)
    }

    /// Integrates one insert whose origins are already present.
    pub fn insert(
        &mut self,
        id: OpId,
        value: T,
        origin_left: Option<OpId>,
        origin_right: Option<OpId>,
    ) {
        if self.position(&id).is_some() {
            return;
        }
        let start = origin_left
            .and_then(|left| self.position(&left))
            .map_or(0, |idx| idx + 1);
        let end = origin_right
            .and_then(|right| self.position(&right))
            .unwrap_or(self.elements.len());

        let mut dest = start;
        let mut before_origin: Vec<OpId> = Vec::new();
        let mut conflicting: Vec<OpId> = Vec::new();
        for (offset, other) in self.elements[start..end.max(start)].iter().enumerate() {
            let idx = start + offset;
            before_origin.push(other.id);
            conflicting.push(other.id);

            if other.origin_left == origin_left {
                if other.id < id {
                    dest = idx + 1;
                    conflicting.clear();
                } else if other.origin_right == origin_right {
                    break;
                }
            } else if let Some(parent) = other.origin_left {
                if !before_origin.contains(&parent) {
                    break;
                }
                if !conflicting.contains(&parent) {
                    dest = idx + 1;
                    conflicting.clear();
                }
            } else {
                break;
            }
        }

        self.elements.insert(
            dest,
            Element {
                id,
                value,
                origin_left,
                origin_right,
            },
        );
    }

    pub fn delete(&mut self, target: OpId) {
        self.deleted.insert(target);
    }

    pub fn elements(&self) -> Vec<T> {
        self.elements
            .iter()
            .filter(|elem| !self.deleted.contains(&elem.id))
            .map(|elem| elem.value.clone())
            .collect()
    }
}

/// Integrates `ops` in canonical order: repeatedly the smallest-id insert
/// whose origins are present, then every delete. Inserts whose origins
/// never appear are left out.
pub fn replay<T: Clone>(ops: impl IntoIterator<Item = SequenceOp<T>>) -> Sequence<T> {
    let mut inserts: BTreeMap<OpId, (T, Option<OpId>, Option<OpId>)> = BTreeMap::new();
    let mut deletes = Vec::new();
    for op in ops {
        match op {
            SequenceOp::Insert {
                id,
                value,
                origin_left,
                origin_right,
            } => {
                inserts.entry(id).or_insert((value, origin_left, origin_right));
            }
            SequenceOp::Delete { target, .. } => deletes.push(target),
        }
    }

    let mut seq = Sequence::new();
    loop {
        let ready = inserts.iter().find_map(|(id, (_, left, right))| {
            let present = |origin: &Option<OpId>| {
                origin.is_none_or(|origin| seq.position(&origin).is_some())
            };
            (present(left) && present(right)).then_some(*id)
        });
        let Some(id) = ready else {
            break;
        };
        if let Some((value, left, right)) = inserts.remove(&id) {
            seq.insert(id, value, left, right);
        }
    }

    for target in deletes {
        seq.delete(target);
    }
    seq
}

/// Visible text after [`replay`].
pub fn replay_text(ops: impl IntoIterator<Item = SequenceOp<char>>) -> String {
    replay(ops).elements().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(replica: u64, counter: u64, value: char, left: Option<OpId>) -> SequenceOp<char> {
        SequenceOp::Insert {
            id: OpId::new(replica, counter),
            value,
            origin_left: left,
            origin_right: None,
        }
    }

    #[test]
    fn test_concurrent_siblings_order_by_id() {
        let ops = vec![ins(2, 1, 'b', None), ins(1, 1, 'a', None)];
        assert_eq!(replay_text(ops), "ab");
    }

    #[test]
    fn test_chain_and_delete() {
        let a = OpId::new(1, 1);
        let ops = vec![
            ins(1, 2, 'b', Some(a)),
            ins(1, 1, 'a', None),
            SequenceOp::Delete {
                id: OpId::new(1, 3),
                target: a,
            },
        ];
        assert_eq!(replay_text(ops), "b");
    }

    #[test]
    fn test_orphan_is_dropped() {
        let ops = vec![ins(1, 2, 'x', Some(OpId::new(7, 7)))];
        assert_eq!(replay_text(ops), "");
    }
}
