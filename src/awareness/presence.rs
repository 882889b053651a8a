//! Typed view of the awareness state an editor session publishes.

use crate::binding::Anchor;
use crate::core::{ReplicaId, Sequence};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub color: String,
}

impl UserInfo {
    /// A user with a stable color derived from the replica id.
    pub fn new(name: impl Into<String>, replica: ReplicaId) -> Self {
        Self {
            name: name.into(),
            color: color_for(replica),
        }
    }
}

/// Selection pinned to element ids, so it stays on the same characters
/// while other peers edit. `anchor == head` is a plain cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: Anchor,
    pub head: Anchor,
}

impl CursorRange {
    pub fn collapsed(at: Anchor) -> Self {
        Self {
            anchor: at,
            head: at,
        }
    }

    /// Offsets `(anchor, head)` in `doc`. `None` until the element under the
    /// head has arrived; an unknown anchor falls back to the head.
    pub fn resolve<T: Clone + PartialEq>(&self, doc: &Sequence<T>) -> Option<(usize, usize)> {
        let head = self.head.resolve(doc)?;
        Some((self.anchor.resolve(doc).unwrap_or(head), head))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorRange>,
}

impl Presence {
    pub fn new(user: UserInfo) -> Self {
        Self { user, cursor: None }
    }

    pub fn with_cursor(self, at: Anchor) -> Self {
        self.with_selection(at, at)
    }

    pub fn with_selection(mut self, anchor: Anchor, head: Anchor) -> Self {
        self.cursor = Some(CursorRange { anchor, head });
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parses a remote state; `None` if it does not look like a presence.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Hex color picked from the replica id. Hue varies, saturation and
/// lightness stay fixed so every cursor is equally readable.
pub fn color_for(replica: ReplicaId) -> String {
    let hue = (replica % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
