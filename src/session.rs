//! One replica of a shared document: the text sequence, the operation log,
//! the peer protocol, presence, and the editor it drives.

use crate::awareness::{Awareness, Presence};
use crate::binding::{Anchor, Binding, Delta, Editor};
use crate::config::Config;
use crate::core::{
    ApplyOutcome, IdAllocator, OpId, ReplicaId, Sequence, SequenceOp, StateVector,
    random_replica_id,
};
use crate::error::Error;
use crate::sync::{Inbound, OpLog, Operation, PeerId, SyncEngine, Transport};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, warn};

pub struct Session<T, E> {
    allocator: IdAllocator,
    doc: Sequence<char>,
    log: OpLog,
    /// Remote ops the document is still buffering. They reach `log` only
    /// once they integrate.
    held: BTreeMap<OpId, Operation>,
    engine: SyncEngine,
    awareness: Awareness,
    binding: Binding,
    transport: T,
    editor: E,
}

impl<T: Transport, E: Editor> Session<T, E> {
    pub fn new(replica: ReplicaId, config: &Config, transport: T, editor: E) -> Self {
        Self {
            allocator: IdAllocator::new(replica),
            doc: Sequence::new(),
            log: OpLog::new(),
            held: BTreeMap::new(),
            engine: SyncEngine::new(config.sync.clone(), config.limits.clone()),
            awareness: Awareness::new(replica, config.awareness.clone()),
            binding: Binding::new(),
            transport,
            editor,
        }
    }

    pub fn with_random_replica(config: &Config, transport: T, editor: E) -> Self {
        Self::new(random_replica_id(), config, transport, editor)
    }

    pub fn replica(&self) -> ReplicaId {
        self.allocator.replica()
    }

    pub fn text(&self) -> String {
        self.doc.to_text()
    }

    pub fn state_vector(&self) -> &StateVector {
        self.log.state_vector()
    }

    pub fn document(&self) -> &Sequence<char> {
        &self.doc
    }

    pub fn log(&self) -> &OpLog {
        &self.log
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn awareness_mut(&mut self) -> &mut Awareness {
        &mut self.awareness
    }

    pub fn editor(&self) -> &E {
        &self.editor
    }

    pub fn editor_mut(&mut self) -> &mut E {
        &mut self.editor
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The editor reported `delta`, already applied to its own buffer.
    /// Records the resulting operations and pushes them to peers.
    pub fn local_edit(&mut self, delta: &Delta) -> Result<Vec<Operation>, Error> {
        let ops = self
            .binding
            .on_local_change(&mut self.doc, &mut self.allocator, delta)?;
        for op in &ops {
            self.log.insert(op.clone());
        }
        self.engine.broadcast_ops(&ops, &mut self.transport);
        Ok(ops)
    }

    /// Applies `delta` to the editor and then handles it as a local edit.
    pub fn edit(&mut self, delta: Delta) -> Result<Vec<Operation>, Error> {
        let len = self.doc.len_visible();
        let in_range = match &delta {
            Delta::Insert { position, .. } => *position <= len,
            Delta::Delete { position, length } => {
                position.checked_add(*length).is_some_and(|end| end <= len)
            }
        };
        if in_range {
            self.editor.apply_delta(&delta);
        }
        self.local_edit(&delta)
    }

    pub fn peer_connected(&mut self, peer: PeerId, now: Instant) {
        self.engine
            .peer_connected(peer, &self.log, &mut self.transport, now);
        if let Some(update) = self.awareness.local_update() {
            self.engine
                .send_awareness(peer, update, &mut self.transport);
        }
    }

    pub fn peer_disconnected(&mut self, peer: PeerId) {
        self.engine.peer_disconnected(peer);
    }

    /// Handles one message from `peer`. Malformed input is logged and
    /// dropped; it never surfaces as an error.
    pub fn receive(&mut self, peer: PeerId, bytes: &[u8], now: Instant) {
        let inbound = self
            .engine
            .receive(peer, bytes, &self.log, &mut self.transport, now);
        match inbound {
            Inbound::None => {}
            Inbound::Operations(ops) => self.merge(peer, ops),
            Inbound::Awareness(update) => {
                self.awareness.apply_update(update, now);
            }
        }
    }

    fn merge(&mut self, peer: PeerId, ops: Vec<Operation>) {
        for op in ops {
            let id = op.id();
            match self
                .binding
                .on_remote_operation(&mut self.doc, op.clone(), &mut self.editor)
            {
                Ok(ApplyOutcome::Pending) => {
                    debug!(%peer, %id, "buffered remote operation");
                    self.held.insert(id, op);
                }
                Ok(outcome) => {
                    debug!(%peer, %id, ?outcome, "merged remote operation");
                    self.log.insert(op);
                }
                Err(err) => error!(%peer, %id, error = %err, "rejected remote operation"),
            }
        }
        self.settle_held();
    }

    /// Logs held ops the document has since integrated and forgets the ones
    /// it dropped on release.
    fn settle_held(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let doc = &self.doc;
        let (waiting, settled): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|(id, _)| doc.is_pending(id));
        self.held = waiting;

        for (id, op) in settled {
            let integrated = match &op {
                SequenceOp::Insert {
                    value,
                    origin_left,
                    origin_right,
                    ..
                } => self.doc.get_element(&id).is_some_and(|elem| {
                    elem.value == *value
                        && elem.origin_left == *origin_left
                        && elem.origin_right == *origin_right
                }),
                SequenceOp::Delete { .. } => true,
            };
            if integrated {
                self.log.insert(op);
            } else {
                warn!(%id, "buffered operation was dropped, leaving it out of the log");
            }
        }
    }

    /// Publishes a new local presence state.
    pub fn set_presence(&mut self, state: Value, now: Instant) {
        let update = self.awareness.set_local_state(state, now);
        self.engine
            .broadcast_awareness(update, &mut self.transport);
    }

    /// Publishes the local selection, pinned to element ids, along with the
    /// user info already set.
    pub fn publish_cursor(&mut self, now: Instant) {
        let Some(presence) = self.awareness.local_state().and_then(Presence::from_value) else {
            return;
        };
        let (anchor, head) = self.editor.selection();
        let presence =
            presence.with_selection(Anchor::at(&self.doc, anchor), Anchor::at(&self.doc, head));
        self.set_presence(presence.to_value(), now);
    }

    /// Where each remote peer's selection falls in the local text right now,
    /// as `(anchor, head)` offsets. Peers whose anchored element has not
    /// arrived yet are left out.
    pub fn peer_selections(&self) -> BTreeMap<ReplicaId, (usize, usize)> {
        self.awareness
            .states()
            .filter_map(|(replica, state)| {
                let cursor = Presence::from_value(state)?.cursor?;
                Some((replica, cursor.resolve(&self.doc)?))
            })
            .collect()
    }

    /// Announces that this replica is going offline.
    pub fn leave(&mut self) {
        let update = self.awareness.clear_local_state();
        self.engine
            .broadcast_awareness(update, &mut self.transport);
    }

    /// Periodic maintenance: liveness, resync, and awareness expiry.
    pub fn tick(&mut self, now: Instant) {
        self.engine.tick(&self.log, &mut self.transport, now);
        if let Some(update) = self.awareness.tick(now) {
            self.engine
                .broadcast_awareness(update, &mut self.transport);
        }
    }
}

impl<T, E> std::fmt::Debug for Session<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("replica", &self.allocator.replica())
            .field("ops", &self.log.len())
            .field("visible", &self.doc.len_visible())
            .finish()
    }
}
