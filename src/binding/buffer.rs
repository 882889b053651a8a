use super::{Delta, Editor};

/// Plain in-memory editor: a character buffer, a cursor and an optional
/// selection anchor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    chars: Vec<char>,
    cursor: usize,
    /// Far end of the selection; `None` when it is collapsed.
    anchor: Option<usize>,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            cursor: 0,
            anchor: None,
        }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

impl Editor for TextBuffer {
    fn buffer(&self) -> String {
        self.chars.iter().collect()
    }

    /// Out-of-range deltas are clamped to the buffer.
    fn apply_delta(&mut self, delta: &Delta) {
        match delta {
            Delta::Insert { position, text } => {
                let at = (*position).min(self.chars.len());
                let inserted: Vec<char> = text.chars().collect();
                let count = inserted.len();
                self.chars.splice(at..at, inserted);
                let shift = |offset: usize| if offset > at { offset + count } else { offset };
                self.cursor = shift(self.cursor);
                self.anchor = self.anchor.map(shift);
            }
            Delta::Delete { position, length } => {
                let start = (*position).min(self.chars.len());
                let end = start.saturating_add(*length).min(self.chars.len());
                self.chars.drain(start..end);
                let shift = |offset: usize| {
                    if offset > start {
                        start.max(offset.saturating_sub(end - start))
                    } else {
                        offset
                    }
                };
                self.cursor = shift(self.cursor);
                self.anchor = self.anchor.map(shift);
            }
        }
    }

    fn cursor(&self) -> usize {
        self.cursor
    }

    fn set_cursor(&mut self, position: usize) {
        self.cursor = position.min(self.chars.len());
        self.anchor = None;
    }

    fn selection(&self) -> (usize, usize) {
        (self.anchor.unwrap_or(self.cursor), self.cursor)
    }

    fn set_selection(&mut self, anchor: usize, head: usize) {
        self.cursor = head.min(self.chars.len());
        let anchor = anchor.min(self.chars.len());
        self.anchor = (anchor != self.cursor).then_some(anchor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_delete() {
        let mut buf = TextBuffer::from_text("hello");
        buf.apply_delta(&Delta::Insert {
            position: 5,
            text: " world".into(),
        });
        buf.apply_delta(&Delta::Delete {
            position: 0,
            length: 1,
        });
        assert_eq!(buf.buffer(), "ello world");
    }

    #[test]
    fn test_cursor_follows_edits_before_it() {
        let mut buf = TextBuffer::from_text("abcd");
        buf.set_cursor(3);
        buf.apply_delta(&Delta::Delete {
            position: 0,
            length: 2,
        });
        assert_eq!(buf.cursor(), 1);
        buf.apply_delta(&Delta::Insert {
            position: 0,
            text: "xyz".into(),
        });
        assert_eq!(buf.cursor(), 4);
    }

    #[test]
    fn test_set_cursor_clamps() {
        let mut buf = TextBuffer::from_text("ab");
        buf.set_cursor(10);
        assert_eq!(buf.cursor(), 2);
    }

    #[test]
    fn test_selection_follows_deletes_and_collapses() {
        let mut buf = TextBuffer::from_text("abcdef");
        buf.set_selection(1, 4);
        buf.apply_delta(&Delta::Delete {
            position: 0,
            length: 1,
        });
        assert_eq!(buf.selection(), (0, 3));

        buf.set_cursor(2);
        assert_eq!(buf.selection(), (2, 2));
    }
}
