//! Ordered sequence CRDT with tombstones.
//!
//! Every element remembers the ids of its neighbours at insertion time
//! (`origin_left`, `origin_right`). Remote inserts are integrated by scanning
//! the gap between those origins and ordering concurrent siblings by
//! [`OpId`], so the final order depends only on the set of operations and
//! never on the order in which they arrived.
//!
//! `None` origins stand for the document boundaries: a `None` left origin is
//! the start sentinel, a `None` right origin the end sentinel.

use super::{IdAllocator, OpId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element<T> {
    pub id: OpId,
    pub value: T,
    pub origin_left: Option<OpId>,
    pub origin_right: Option<OpId>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SequenceOp<T> {
    Insert {
        id: OpId,
        value: T,
        origin_left: Option<OpId>,
        origin_right: Option<OpId>,
    },
    Delete {
        id: OpId,
        target: OpId,
    },
}

impl<T> SequenceOp<T> {
    pub fn id(&self) -> OpId {
        match self {
            SequenceOp::Insert { id, .. } | SequenceOp::Delete { id, .. } => *id,
        }
    }
}

/// What happened to a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already integrated; nothing changed.
    Duplicate,
    /// Waiting for an origin or delete target that has not arrived yet.
    Pending,
}

/// A change to the visible sequence, positioned at the moment it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibleChange<T> {
    Insert { id: OpId, index: usize, value: T },
    Delete { id: OpId, index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("position {position} is out of bounds for visible length {len}")]
pub struct IndexError {
    pub position: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("operation {id} reuses an existing id with a different payload")]
    DuplicateIdMismatch { id: OpId },
    #[error("operation {id} has its left origin after its right origin")]
    OriginsOutOfOrder { id: OpId },
    #[error("operation {id} references itself")]
    SelfReference { id: OpId },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sequence<T> {
    elements: Vec<Element<T>>,
    index: BTreeMap<OpId, usize>,
    /// Inserts keyed by the origin they are waiting for.
    pending_inserts: BTreeMap<OpId, Vec<SequenceOp<T>>>,
    /// Deletes keyed by their target.
    pending_deletes: BTreeMap<OpId, Vec<SequenceOp<T>>>,
}

impl<T: Clone + PartialEq> Sequence<T> {
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
            index: BTreeMap::new(),
            pending_inserts: BTreeMap::new(),
            pending_deletes: BTreeMap::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.elements
            .iter()
            .filter(|elem| !elem.deleted)
            .map(|elem| &elem.value)
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &Element<T>> {
        self.elements.iter()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    pub fn len_visible(&self) -> usize {
        self.elements.iter().filter(|elem| !elem.deleted).count()
    }

    /// Number of stored elements, tombstones included.
    pub fn len_physical(&self) -> usize {
        self.elements.len()
    }

    pub fn get_element(&self, id: &OpId) -> Option<&Element<T>> {
        self.index.get(id).and_then(|idx| self.elements.get(*idx))
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.index.contains_key(id)
    }

    pub fn element_ids(&self) -> Vec<OpId> {
        self.elements.iter().map(|elem| elem.id).collect()
    }

    /// Number of buffered operations still waiting for a dependency.
    pub fn pending_len(&self) -> usize {
        self.pending_inserts.values().map(Vec::len).sum::<usize>()
            + self.pending_deletes.values().map(Vec::len).sum::<usize>()
    }

    /// Whether the operation `id` sits in a buffer waiting for a dependency.
    pub fn is_pending(&self, id: &OpId) -> bool {
        self.pending_inserts
            .values()
            .chain(self.pending_deletes.values())
            .flatten()
            .any(|op| op.id() == *id)
    }

    /// Visible index of a live element.
    pub fn visible_index_of(&self, id: &OpId) -> Option<usize> {
        let idx = *self.index.get(id)?;
        if self.elements[idx].deleted {
            return None;
        }
        Some(self.visible_before(idx))
    }

    /// Visible offset of the gap right after `id`, tombstones included.
    pub fn visible_offset_after(&self, id: &OpId) -> Option<usize> {
        let idx = *self.index.get(id)?;
        Some(self.visible_before(idx + 1))
    }

    /// Id of the element shown at visible `position`.
    pub fn id_at(&self, position: usize) -> Option<OpId> {
        self.physical_of_visible(position)
            .map(|idx| self.elements[idx].id)
    }

    /// Inserts `value` so that it appears at visible `position`.
    pub fn local_insert(
        &mut self,
        allocator: &mut IdAllocator,
        position: usize,
        value: T,
    ) -> Result<SequenceOp<T>, IndexError> {
        let gap = self.gap_for(position)?;
        let origin_left = gap.checked_sub(1).map(|idx| self.elements[idx].id);
        let origin_right = self.elements.get(gap).map(|elem| elem.id);
        let id = allocator.next_id();

        self.insert_at(gap, id, value.clone(), origin_left, origin_right);
        Ok(SequenceOp::Insert {
            id,
            value,
            origin_left,
            origin_right,
        })
    }

    /// Inserts a run of values left to right starting at `position`.
    pub fn local_insert_run<I>(
        &mut self,
        allocator: &mut IdAllocator,
        position: usize,
        values: I,
    ) -> Result<Vec<SequenceOp<T>>, IndexError>
    where
        I: IntoIterator<Item = T>,
    {
        self.gap_for(position)?;
        let mut ops = Vec::new();
        for (offset, value) in values.into_iter().enumerate() {
            ops.push(self.local_insert(allocator, position + offset, value)?);
        }
        Ok(ops)
    }

    /// Tombstones `length` visible elements starting at `position`.
    pub fn local_delete(
        &mut self,
        allocator: &mut IdAllocator,
        position: usize,
        length: usize,
    ) -> Result<Vec<SequenceOp<T>>, IndexError> {
        let len = self.len_visible();
        let end = position.checked_add(length).unwrap_or(usize::MAX);
        if end > len {
            return Err(IndexError { position: end, len });
        }

        let targets: Vec<usize> = self
            .elements
            .iter()
            .enumerate()
            .filter(|(_, elem)| !elem.deleted)
            .skip(position)
            .take(length)
            .map(|(idx, _)| idx)
            .collect();

        let mut ops = Vec::with_capacity(targets.len());
        for idx in targets {
            let elem = &mut self.elements[idx];
            elem.deleted = true;
            ops.push(SequenceOp::Delete {
                id: allocator.next_id(),
                target: elem.id,
            });
        }
        Ok(ops)
    }

    /// Integrates an operation produced by another replica.
    pub fn apply_remote(&mut self, op: SequenceOp<T>) -> Result<ApplyOutcome, MergeError> {
        let mut changes = Vec::new();
        self.apply_remote_tracked(op, &mut changes)
    }

    /// Like [`Sequence::apply_remote`], also reporting every visible change,
    /// including buffered operations released by this one.
    pub fn apply_remote_tracked(
        &mut self,
        op: SequenceOp<T>,
        changes: &mut Vec<VisibleChange<T>>,
    ) -> Result<ApplyOutcome, MergeError> {
        let outcome = self.apply_now(op, changes)?;
        if let Some(released) = outcome.1 {
            self.process_pending(released, changes);
        }
        Ok(outcome.0)
    }

    fn apply_now(
        &mut self,
        op: SequenceOp<T>,
        changes: &mut Vec<VisibleChange<T>>,
    ) -> Result<(ApplyOutcome, Option<OpId>), MergeError> {
        match op {
            SequenceOp::Insert {
                id,
                value,
                origin_left,
                origin_right,
            } => {
                if let Some(existing) = self.get_element(&id) {
                    if existing.value == value
                        && existing.origin_left == origin_left
                        && existing.origin_right == origin_right
                    {
                        return Ok((ApplyOutcome::Duplicate, None));
                    }
                    return Err(MergeError::DuplicateIdMismatch { id });
                }
                if origin_left == Some(id) || origin_right == Some(id) {
                    return Err(MergeError::SelfReference { id });
                }

                let missing = [origin_left, origin_right]
                    .into_iter()
                    .flatten()
                    .find(|origin| !self.index.contains_key(origin));
                if let Some(anchor) = missing {
                    let op = SequenceOp::Insert {
                        id,
                        value,
                        origin_left,
                        origin_right,
                    };
                    Self::buffer(&mut self.pending_inserts, anchor, op);
                    return Ok((ApplyOutcome::Pending, None));
                }

                let idx = self.integrate(id, value.clone(), origin_left, origin_right)?;
                changes.push(VisibleChange::Insert {
                    id,
                    index: self.visible_before(idx),
                    value,
                });
                Ok((ApplyOutcome::Applied, Some(id)))
            }
            SequenceOp::Delete { id, target } => {
                let Some(idx) = self.index.get(&target).copied() else {
                    Self::buffer(
                        &mut self.pending_deletes,
                        target,
                        SequenceOp::Delete { id, target },
                    );
                    return Ok((ApplyOutcome::Pending, None));
                };
                if self.elements[idx].deleted {
                    return Ok((ApplyOutcome::Duplicate, None));
                }
                let index = self.visible_before(idx);
                self.elements[idx].deleted = true;
                changes.push(VisibleChange::Delete { id: target, index });
                Ok((ApplyOutcome::Applied, None))
            }
        }
    }

    fn buffer(queue: &mut BTreeMap<OpId, Vec<SequenceOp<T>>>, key: OpId, op: SequenceOp<T>) {
        let waiting = queue.entry(key).or_default();
        if !waiting.iter().any(|queued| queued.id() == op.id()) {
            waiting.push(op);
        }
    }

    fn process_pending(&mut self, inserted_id: OpId, changes: &mut Vec<VisibleChange<T>>) {
        let mut queue = VecDeque::new();
        self.enqueue_pending(inserted_id, &mut queue);

        while let Some(op) = queue.pop_front() {
            let op_id = op.id();
            match self.apply_now(op, changes) {
                Ok((_, Some(released))) => self.enqueue_pending(released, &mut queue),
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(op = %op_id, error = %err, "dropping buffered operation");
                }
            }
        }
    }

    fn enqueue_pending(&mut self, id: OpId, queue: &mut VecDeque<SequenceOp<T>>) {
        if let Some(ops) = self.pending_inserts.remove(&id) {
            queue.extend(ops);
        }
        if let Some(ops) = self.pending_deletes.remove(&id) {
            queue.extend(ops);
        }
    }

    /// Places a new element between its origins, ordering it against
    /// concurrent inserts into the same gap. Returns its physical index.
    fn integrate(
        &mut self,
        id: OpId,
        value: T,
        origin_left: Option<OpId>,
        origin_right: Option<OpId>,
    ) -> Result<usize, MergeError> {
        let start = match origin_left {
            Some(left) => self.index[&left] + 1,
            None => 0,
        };
        let end = match origin_right {
            Some(right) => self.index[&right],
            None => self.elements.len(),
        };
        if start > end {
            return Err(MergeError::OriginsOutOfOrder { id });
        }

        let mut dest = start;
        let mut scanned = BTreeSet::new();
        let mut conflicting = BTreeSet::new();
        for idx in start..end {
            let other = &self.elements[idx];
            scanned.insert(other.id);
            conflicting.insert(other.id);

            if other.origin_left == origin_left {
                if other.id < id {
                    dest = idx + 1;
                    conflicting.clear();
                } else if other.origin_right == origin_right {
                    break;
                }
            } else if other
                .origin_left
                .is_some_and(|parent| scanned.contains(&parent))
            {
                let parent = other.origin_left;
                if !parent.is_some_and(|parent| conflicting.contains(&parent)) {
                    dest = idx + 1;
                    conflicting.clear();
                }
            } else {
                break;
            }
        }

        self.insert_at(dest, id, value, origin_left, origin_right);
        Ok(dest)
    }

    fn insert_at(
        &mut self,
        idx: usize,
        id: OpId,
        value: T,
        origin_left: Option<OpId>,
        origin_right: Option<OpId>,
    ) {
        self.elements.insert(
            idx,
            Element {
                id,
                value,
                origin_left,
                origin_right,
                deleted: false,
            },
        );
        for (offset, elem) in self.elements[idx..].iter().enumerate() {
            self.index.insert(elem.id, idx + offset);
        }
    }

    /// Physical index of the gap where visible `position` starts.
    fn gap_for(&self, position: usize) -> Result<usize, IndexError> {
        if position == 0 {
            return Ok(0);
        }
        self.physical_of_visible(position - 1)
            .map(|idx| idx + 1)
            .ok_or(IndexError {
                position,
                len: self.len_visible(),
            })
    }

    fn physical_of_visible(&self, position: usize) -> Option<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, elem)| !elem.deleted)
            .nth(position)
            .map(|(idx, _)| idx)
    }

    fn visible_before(&self, idx: usize) -> usize {
        self.elements[..idx]
            .iter()
            .filter(|elem| !elem.deleted)
            .count()
    }
}

impl Sequence<char> {
    pub fn to_text(&self) -> String {
        self.iter().collect()
    }
}
