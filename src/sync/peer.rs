use crate::core::{OpId, ReplicaId, StateVector};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Disconnected,
    Handshaking,
    Synced,
}

/// Handshake and liveness bookkeeping for one remote peer.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    state: PeerState,
    /// What we believe the peer holds.
    remote_vector: StateVector,
    batch_sent: bool,
    batch_received: bool,
    last_seen: Instant,
    last_announce: Instant,
    decode_failures: u32,
}

impl PeerConnection {
    pub fn new(now: Instant) -> Self {
        Self {
            state: PeerState::Disconnected,
            remote_vector: StateVector::new(),
            batch_sent: false,
            batch_received: false,
            last_seen: now,
            last_announce: now,
            decode_failures: 0,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == PeerState::Synced
    }

    /// Whether live operations should be pushed to this peer. Once our
    /// handshake batch is out, anything newer must follow it directly.
    pub fn accepts_broadcast(&self) -> bool {
        match self.state {
            PeerState::Synced => true,
            PeerState::Handshaking => self.batch_sent,
            PeerState::Disconnected => false,
        }
    }

    pub fn remote_vector(&self) -> &StateVector {
        &self.remote_vector
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn last_announce(&self) -> Instant {
        self.last_announce
    }

    /// Starts a fresh handshake round.
    pub fn connect(&mut self, now: Instant) {
        self.state = PeerState::Handshaking;
        self.batch_sent = false;
        self.batch_received = false;
        self.last_seen = now;
        self.last_announce = now;
        self.decode_failures = 0;
    }

    pub fn disconnect(&mut self) {
        self.state = PeerState::Disconnected;
        self.batch_sent = false;
        self.batch_received = false;
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn announced(&mut self, now: Instant) {
        self.last_announce = now;
    }

    /// Records the peer's vector. When it already covers everything
    /// `local` holds from the peer's side there is nothing to wait for.
    pub fn vector_received(&mut self, vector: &StateVector, local: &StateVector) {
        self.remote_vector.merge(vector);
        if local.covers(vector) {
            self.batch_received = true;
        }
    }

    pub fn batch_sent(&mut self) {
        self.batch_sent = true;
    }

    /// Records a batch from the peer. Only ids that extend the contiguous
    /// prefix for their replica move `remote_vector`; anything past a gap is
    /// left for a later batch or vector to confirm.
    pub fn batch_received(&mut self, ids: impl IntoIterator<Item = OpId>) {
        let ids: BTreeSet<(ReplicaId, u64)> =
            ids.into_iter().map(|id| (id.replica, id.counter)).collect();
        for (replica, counter) in ids {
            if counter == self.remote_vector.counter(replica) + 1 {
                self.remote_vector.set(replica, counter);
            }
        }
        self.batch_received = true;
    }

    /// Moves a handshaking connection to `Synced` once both directions are
    /// done. Returns `true` on the transition.
    pub fn try_complete(&mut self) -> bool {
        if self.state == PeerState::Handshaking && self.batch_sent && self.batch_received {
            self.state = PeerState::Synced;
            return true;
        }
        false
    }

    /// Counts a decode failure; returns the running total.
    pub fn decode_failed(&mut self) -> u32 {
        self.decode_failures += 1;
        self.decode_failures
    }

    pub fn decode_succeeded(&mut self) {
        self.decode_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_needs_both_directions() {
        let now = Instant::now();
        let mut conn = PeerConnection::new(now);
        assert_eq!(conn.state(), PeerState::Disconnected);

        conn.connect(now);
        assert_eq!(conn.state(), PeerState::Handshaking);

        conn.batch_sent();
        assert!(conn.accepts_broadcast());
        assert!(!conn.try_complete());

        conn.batch_received([OpId::new(2, 1)]);
        assert!(conn.try_complete());
        assert!(conn.is_synced());
        assert_eq!(conn.remote_vector().get(2), Some(1));
    }

    #[test]
    fn test_covered_vector_skips_waiting_for_batch() {
        let now = Instant::now();
        let mut conn = PeerConnection::new(now);
        conn.connect(now);

        let mut local = StateVector::new();
        local.set(1, 3);
        let mut remote = StateVector::new();
        remote.set(1, 2);

        conn.vector_received(&remote, &local);
        conn.batch_sent();
        assert!(conn.try_complete());
    }

    #[test]
    fn test_reconnect_resets_handshake() {
        let now = Instant::now();
        let mut conn = PeerConnection::new(now);
        conn.connect(now);
        conn.batch_sent();
        conn.batch_received([]);
        assert!(conn.try_complete());

        conn.disconnect();
        conn.connect(now);
        assert_eq!(conn.state(), PeerState::Handshaking);
        assert!(!conn.try_complete());
    }

    #[test]
    fn test_batch_with_gap_advances_only_contiguous_prefix() {
        let now = Instant::now();
        let mut conn = PeerConnection::new(now);
        conn.connect(now);

        conn.batch_received([OpId::new(2, 4), OpId::new(2, 1), OpId::new(2, 2)]);
        assert_eq!(conn.remote_vector().counter(2), 2);

        conn.batch_received([OpId::new(2, 3)]);
        assert_eq!(conn.remote_vector().counter(2), 3);
    }
}
