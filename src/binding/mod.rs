//! Glue between an editor widget and the text sequence.
//!
//! Local deltas reported by the editor become sequence operations; remote
//! operations are merged and replayed onto the editor buffer as minimal
//! deltas. Both ends of the local selection are held relative to stable
//! element ids rather than raw offsets, so remote edits around them never
//! shift them incorrectly. The same [`Anchor`] is what peers publish in
//! their presence.

use crate::core::{
    ApplyOutcome, IdAllocator, IndexError, MergeError, OpId, Sequence, SequenceOp, VisibleChange,
};
use serde::{Deserialize, Serialize};

mod buffer;

pub use buffer::TextBuffer;

/// An edit expressed in character offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delta {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
}

impl From<VisibleChange<char>> for Delta {
    fn from(change: VisibleChange<char>) -> Self {
        match change {
            VisibleChange::Insert { index, value, .. } => Delta::Insert {
                position: index,
                text: value.to_string(),
            },
            VisibleChange::Delete { index, .. } => Delta::Delete {
                position: index,
                length: 1,
            },
        }
    }
}

/// The editor collaborator.
pub trait Editor {
    fn buffer(&self) -> String;
    fn apply_delta(&mut self, delta: &Delta);
    fn cursor(&self) -> usize;
    fn set_cursor(&mut self, position: usize);

    /// Current selection as `(anchor, head)`. The head is the caret.
    fn selection(&self) -> (usize, usize) {
        let cursor = self.cursor();
        (cursor, cursor)
    }

    /// Editors without selections only move the caret.
    fn set_selection(&mut self, _anchor: usize, head: usize) {
        self.set_cursor(head);
    }
}

/// A position pinned to the element on its left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    Start,
    After(OpId),
}

impl Anchor {
    /// Anchor for visible `position`, clamped to the document.
    pub fn at<T: Clone + PartialEq>(doc: &Sequence<T>, position: usize) -> Self {
        let position = position.min(doc.len_visible());
        match position.checked_sub(1).and_then(|left| doc.id_at(left)) {
            Some(id) => Anchor::After(id),
            None => Anchor::Start,
        }
    }

    /// Current visible offset, or `None` while the anchored element has not
    /// reached `doc`.
    pub fn resolve<T: Clone + PartialEq>(&self, doc: &Sequence<T>) -> Option<usize> {
        match self {
            Anchor::Start => Some(0),
            Anchor::After(id) => doc.visible_offset_after(id),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Binding {
    selection: Option<(Anchor, Anchor)>,
}

impl Binding {
    pub fn new() -> Self {
        Self { selection: None }
    }

    pub fn cursor_anchor(&self) -> Option<Anchor> {
        self.selection.map(|(_, head)| head)
    }

    pub fn selection_anchors(&self) -> Option<(Anchor, Anchor)> {
        self.selection
    }

    /// Turns an editor delta into sequence operations and applies them.
    pub fn on_local_change(
        &mut self,
        doc: &mut Sequence<char>,
        allocator: &mut IdAllocator,
        delta: &Delta,
    ) -> Result<Vec<SequenceOp<char>>, IndexError> {
        match delta {
            Delta::Insert { position, text } => {
                doc.local_insert_run(allocator, *position, text.chars())
            }
            Delta::Delete { position, length } => doc.local_delete(allocator, *position, *length),
        }
    }

    /// Merges a remote operation and mirrors the visible effect on `editor`.
    pub fn on_remote_operation<E: Editor>(
        &mut self,
        doc: &mut Sequence<char>,
        op: SequenceOp<char>,
        editor: &mut E,
    ) -> Result<ApplyOutcome, MergeError> {
        self.capture_cursor(doc, editor);

        let mut changes = Vec::new();
        let outcome = doc.apply_remote_tracked(op, &mut changes)?;
        if changes.is_empty() {
            return Ok(outcome);
        }
        for change in changes {
            editor.apply_delta(&Delta::from(change));
        }

        self.restore_cursor(doc, editor);
        Ok(outcome)
    }

    /// Pins both ends of the editor's selection to the elements on their left.
    pub fn capture_cursor<E: Editor>(&mut self, doc: &Sequence<char>, editor: &E) {
        let (anchor, head) = editor.selection();
        self.selection = Some((Anchor::at(doc, anchor), Anchor::at(doc, head)));
    }

    /// Moves the editor selection back to its anchors.
    pub fn restore_cursor<E: Editor>(&self, doc: &Sequence<char>, editor: &mut E) {
        let Some((anchor, head)) = self.selection else {
            return;
        };
        let head = head.resolve(doc).unwrap_or(0);
        let anchor = anchor.resolve(doc).unwrap_or(head);
        editor.set_selection(anchor, head);
    }
}
