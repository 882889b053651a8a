//! Ephemeral presence (awareness) protocol.
//!
//! Each replica owns one JSON state blob (name, color, cursor...) tagged with
//! a logical clock. Updates are applied only when their clock is newer than
//! what we hold, so duplicates and reordering are harmless. Remote entries
//! that are not refreshed within the timeout are dropped on [`Awareness::tick`].
//!
//! ```text
//! set_local_state() ──► AwarenessUpdate ──► broadcast
//!                                               │
//! remote apply_update() ◄───────────────────────┘
//!        │
//!        ▼
//! on_change observers
//! ```

use crate::core::ReplicaId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

mod presence;

pub use presence::{CursorRange, Presence, UserInfo};

/// Wire form of one replica's awareness state. A `null` state means the
/// replica went offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub replica: ReplicaId,
    pub clock: u64,
    pub state: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub state: Value,
    pub clock: u64,
    pub last_seen: Instant,
}

/// Which replicas changed in one notification.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ReplicaId>,
    pub updated: Vec<ReplicaId>,
    pub removed: Vec<ReplicaId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwarenessConfig {
    /// Remote entries older than this are expired.
    pub timeout_ms: u64,
}

impl AwarenessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

type ChangeObserver = Box<dyn FnMut(&AwarenessChange)>;

pub struct Awareness {
    local: ReplicaId,
    config: AwarenessConfig,
    clock: u64,
    entries: BTreeMap<ReplicaId, AwarenessEntry>,
    /// Last clock seen for replicas whose entry was removed, so a replayed
    /// old update cannot bring them back.
    tombstones: BTreeMap<ReplicaId, u64>,
    observers: Vec<ChangeObserver>,
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("local", &self.local)
            .field("clock", &self.clock)
            .field("entries", &self.entries)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl Awareness {
    pub fn new(local: ReplicaId, config: AwarenessConfig) -> Self {
        Self {
            local,
            config,
            clock: 0,
            entries: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            observers: Vec::new(),
        }
    }

    pub fn local_replica(&self) -> ReplicaId {
        self.local
    }

    /// Registers a callback fired whenever the mapping changes.
    pub fn on_change(&mut self, observer: impl FnMut(&AwarenessChange) + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.entries.get(&self.local).map(|entry| &entry.state)
    }

    /// The update to hand a freshly connected peer, if we have a state.
    pub fn local_update(&self) -> Option<AwarenessUpdate> {
        self.entries.get(&self.local).map(|entry| AwarenessUpdate {
            replica: self.local,
            clock: entry.clock,
            state: entry.state.clone(),
        })
    }

    pub fn get(&self, replica: ReplicaId) -> Option<&AwarenessEntry> {
        self.entries.get(&replica)
    }

    pub fn states(&self) -> impl Iterator<Item = (ReplicaId, &Value)> {
        self.entries
            .iter()
            .map(|(replica, entry)| (*replica, &entry.state))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Display names of everyone present, `"Unknown"` for states without one.
    pub fn user_names(&self) -> Vec<String> {
        self.entries
            .values()
            .map(|entry| {
                Presence::from_value(&entry.state)
                    .map(|presence| presence.user.name)
                    .unwrap_or_else(|| "Unknown".to_string())
            })
            .collect()
    }

    /// Replaces the local state and returns the update to broadcast.
    pub fn set_local_state(&mut self, state: Value, now: Instant) -> AwarenessUpdate {
        if state.is_null() {
            return self.clear_local_state();
        }
        self.clock += 1;
        let previous = self.entries.insert(
            self.local,
            AwarenessEntry {
                state: state.clone(),
                clock: self.clock,
                last_seen: now,
            },
        );

        let mut change = AwarenessChange::default();
        match previous {
            None => change.added.push(self.local),
            Some(old) if old.state != state => change.updated.push(self.local),
            Some(_) => {}
        }
        self.notify(&change);

        AwarenessUpdate {
            replica: self.local,
            clock: self.clock,
            state,
        }
    }

    /// Marks the local replica offline.
    pub fn clear_local_state(&mut self) -> AwarenessUpdate {
        self.clock += 1;
        if self.entries.remove(&self.local).is_some() {
            self.notify(&AwarenessChange {
                removed: vec![self.local],
                ..Default::default()
            });
        }
        AwarenessUpdate {
            replica: self.local,
            clock: self.clock,
            state: Value::Null,
        }
    }

    /// Applies a remote update. Returns `true` if it was newer than what we
    /// held; stale and duplicate updates are dropped.
    pub fn apply_update(&mut self, update: AwarenessUpdate, now: Instant) -> bool {
        if update.replica == self.local {
            return false;
        }
        let known = self
            .entries
            .get(&update.replica)
            .map(|entry| entry.clock)
            .or_else(|| self.tombstones.get(&update.replica).copied())
            .unwrap_or(0);
        if update.clock <= known {
            debug!(replica = update.replica, clock = update.clock, known, "stale awareness update");
            return false;
        }

        let mut change = AwarenessChange::default();
        if update.state.is_null() {
            self.tombstones.insert(update.replica, update.clock);
            if self.entries.remove(&update.replica).is_some() {
                change.removed.push(update.replica);
            }
        } else {
            self.tombstones.remove(&update.replica);
            let previous = self.entries.insert(
                update.replica,
                AwarenessEntry {
                    state: update.state.clone(),
                    clock: update.clock,
                    last_seen: now,
                },
            );
            match previous {
                None => change.added.push(update.replica),
                Some(old) if old.state != update.state => change.updated.push(update.replica),
                Some(_) => {}
            }
        }
        self.notify(&change);
        true
    }

    /// Expires silent remote entries and renews the local one.
    ///
    /// Returns a renewal update to broadcast when the local state is older
    /// than half the timeout, so peers keep it alive.
    pub fn tick(&mut self, now: Instant) -> Option<AwarenessUpdate> {
        let timeout = self.config.timeout();
        let expired: Vec<ReplicaId> = self
            .entries
            .iter()
            .filter(|(replica, entry)| {
                **replica != self.local && now.saturating_duration_since(entry.last_seen) > timeout
            })
            .map(|(replica, _)| *replica)
            .collect();

        for replica in &expired {
            if let Some(entry) = self.entries.remove(replica) {
                self.tombstones.insert(*replica, entry.clock);
            }
            debug!(replica, "awareness entry expired");
        }
        if !expired.is_empty() {
            self.notify(&AwarenessChange {
                removed: expired,
                ..Default::default()
            });
        }

        let local = self.entries.get_mut(&self.local)?;
        if now.saturating_duration_since(local.last_seen) < timeout / 2 {
            return None;
        }
        self.clock += 1;
        local.clock = self.clock;
        local.last_seen = now;
        Some(AwarenessUpdate {
            replica: self.local,
            clock: self.clock,
            state: local.state.clone(),
        })
    }

    fn notify(&mut self, change: &AwarenessChange) {
        if change.is_empty() {
            return;
        }
        for observer in &mut self.observers {
            observer(change);
        }
    }
}
