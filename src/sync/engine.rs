use super::{
    DecodeError, OpLog, Operation, PeerConnection, PeerId, PeerState, SyncConfig, SyncMessage,
    Transport, ValidationLimits,
};
use crate::awareness::AwarenessUpdate;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What an inbound message asks the owning replica to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Nothing beyond protocol bookkeeping.
    None,
    /// Operations to merge into the document and the log.
    Operations(Vec<Operation>),
    Awareness(AwarenessUpdate),
}

/// Owns the per-peer connection state machines of one replica.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    config: SyncConfig,
    limits: ValidationLimits,
    peers: BTreeMap<PeerId, PeerConnection>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, limits: ValidationLimits) -> Self {
        Self {
            config,
            limits,
            peers: BTreeMap::new(),
        }
    }

    pub fn state(&self, peer: &PeerId) -> PeerState {
        self.peers
            .get(peer)
            .map_or(PeerState::Disconnected, PeerConnection::state)
    }

    pub fn connection(&self, peer: &PeerId) -> Option<&PeerConnection> {
        self.peers.get(peer)
    }

    pub fn synced_peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers
            .iter()
            .filter(|(_, conn)| conn.is_synced())
            .map(|(peer, _)| *peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = (PeerId, PeerState)> + '_ {
        self.peers.iter().map(|(peer, conn)| (*peer, conn.state()))
    }

    /// Transport reported a new (or renewed) connection: start a handshake.
    pub fn peer_connected<T: Transport>(
        &mut self,
        peer: PeerId,
        log: &OpLog,
        transport: &mut T,
        now: Instant,
    ) {
        let conn = self
            .peers
            .entry(peer)
            .or_insert_with(|| PeerConnection::new(now));
        conn.connect(now);
        info!(%peer, "peer connected, starting handshake");

        let message = SyncMessage::StateVector {
            vector: log.state_vector().clone(),
        };
        Self::send_to(&mut self.peers, peer, &message, transport);
    }

    pub fn peer_disconnected(&mut self, peer: PeerId) {
        if let Some(conn) = self.peers.get_mut(&peer) {
            if conn.state() != PeerState::Disconnected {
                info!(%peer, "peer disconnected");
            }
            conn.disconnect();
        }
    }

    /// Decodes and handles one inbound message.
    pub fn receive<T: Transport>(
        &mut self,
        peer: PeerId,
        bytes: &[u8],
        log: &OpLog,
        transport: &mut T,
        now: Instant,
    ) -> Inbound {
        let message = match SyncMessage::decode(bytes, &self.limits) {
            Ok(message) => message,
            Err(err) => {
                self.decode_failed(peer, &err, now);
                return Inbound::None;
            }
        };

        let conn = self
            .peers
            .entry(peer)
            .or_insert_with(|| PeerConnection::new(now));
        conn.touch(now);
        conn.decode_succeeded();
        debug!(%peer, kind = message.kind(), state = ?conn.state(), "received message");

        match message {
            SyncMessage::StateVector { vector } => {
                if conn.state() == PeerState::Disconnected {
                    // The peer is handshaking with us; answer with our own vector.
                    conn.connect(now);
                    let reply = SyncMessage::StateVector {
                        vector: log.state_vector().clone(),
                    };
                    Self::send_to(&mut self.peers, peer, &reply, transport);
                }
                if let Some(conn) = self.peers.get_mut(&peer) {
                    conn.vector_received(&vector, log.state_vector());
                }

                let ops = log.missing_for(&vector);
                debug!(%peer, ops = ops.len(), "sending missing operations");
                let batches = match SyncMessage::batches(ops, &self.limits) {
                    Ok(batches) => batches,
                    Err(err) => {
                        warn!(%peer, error = %err, "failed to split missing operations");
                        return Inbound::None;
                    }
                };
                // The handshake batch counts as sent only once every chunk is out.
                if Self::send_all(&mut self.peers, peer, &batches, transport) {
                    if let Some(conn) = self.peers.get_mut(&peer) {
                        conn.batch_sent();
                    }
                }
                self.try_complete(peer);
                Inbound::None
            }
            SyncMessage::OperationBatch { ops } => {
                conn.batch_received(ops.iter().map(|op| op.id()));
                self.try_complete(peer);
                if ops.is_empty() {
                    Inbound::None
                } else {
                    Inbound::Operations(ops)
                }
            }
            SyncMessage::Awareness(update) => Inbound::Awareness(update),
        }
    }

    /// Sends freshly generated local operations to every synced peer (and to
    /// handshaking peers that already got our batch).
    pub fn broadcast_ops<T: Transport>(&mut self, ops: &[Operation], transport: &mut T) {
        if ops.is_empty() {
            return;
        }
        match SyncMessage::batches(ops.to_vec(), &self.limits) {
            Ok(batches) => self.broadcast(&batches, transport),
            Err(err) => warn!(error = %err, "failed to split local operations"),
        }
    }

    pub fn broadcast_awareness<T: Transport>(&mut self, update: AwarenessUpdate, transport: &mut T) {
        self.broadcast(&[SyncMessage::Awareness(update)], transport);
    }

    /// Sends an awareness update to a single peer, e.g. right after it connects.
    pub fn send_awareness<T: Transport>(
        &mut self,
        peer: PeerId,
        update: AwarenessUpdate,
        transport: &mut T,
    ) {
        Self::send_to(&mut self.peers, peer, &SyncMessage::Awareness(update), transport);
    }

    /// Drops silent connections and re-announces our vector to synced peers.
    pub fn tick<T: Transport>(&mut self, log: &OpLog, transport: &mut T, now: Instant) {
        let liveness = self.config.liveness_timeout();
        let resync = self.config.resync_interval();

        let mut announce = Vec::new();
        for (peer, conn) in self.peers.iter_mut() {
            if conn.state() == PeerState::Disconnected {
                continue;
            }
            if now.saturating_duration_since(conn.last_seen()) > liveness {
                warn!(%peer, "no traffic within liveness window, disconnecting");
                conn.disconnect();
                continue;
            }
            if conn.is_synced() && now.saturating_duration_since(conn.last_announce()) >= resync {
                conn.announced(now);
                announce.push(*peer);
            }
        }

        if announce.is_empty() {
            return;
        }
        let message = SyncMessage::StateVector {
            vector: log.state_vector().clone(),
        };
        for peer in announce {
            Self::send_to(&mut self.peers, peer, &message, transport);
        }
    }

    fn broadcast<T: Transport>(&mut self, messages: &[SyncMessage], transport: &mut T) {
        let targets: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, conn)| conn.accepts_broadcast())
            .map(|(peer, _)| *peer)
            .collect();
        for peer in targets {
            Self::send_all(&mut self.peers, peer, messages, transport);
        }
    }

    fn try_complete(&mut self, peer: PeerId) {
        if let Some(conn) = self.peers.get_mut(&peer) {
            if conn.try_complete() {
                info!(%peer, "peer synced");
            }
        }
    }

    fn decode_failed(&mut self, peer: PeerId, err: &DecodeError, now: Instant) {
        let conn = self
            .peers
            .entry(peer)
            .or_insert_with(|| PeerConnection::new(now));
        let failures = conn.decode_failed();
        warn!(%peer, error = %err, failures, "dropping undecodable message");
        if failures >= self.config.max_decode_errors && conn.state() != PeerState::Disconnected {
            warn!(%peer, "too many undecodable messages, disconnecting");
            conn.disconnect();
        }
    }

    /// Sends `messages` in order, stopping at the first failure.
    fn send_all<T: Transport>(
        peers: &mut BTreeMap<PeerId, PeerConnection>,
        peer: PeerId,
        messages: &[SyncMessage],
        transport: &mut T,
    ) -> bool {
        messages
            .iter()
            .all(|message| Self::send_to(peers, peer, message, transport))
    }

    /// Sends `message`, downgrading the peer to `Disconnected` on failure.
    fn send_to<T: Transport>(
        peers: &mut BTreeMap<PeerId, PeerConnection>,
        peer: PeerId,
        message: &SyncMessage,
        transport: &mut T,
    ) -> bool {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%peer, error = %err, "failed to encode message");
                return false;
            }
        };
        match transport.send(peer, bytes) {
            Ok(()) => true,
            Err(err) => {
                warn!(%peer, error = %err, "send failed, marking peer disconnected");
                if let Some(conn) = peers.get_mut(&peer) {
                    conn.disconnect();
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OpId, SequenceOp};
    use crate::sync::TransportError;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<(PeerId, SyncMessage)>,
        fail: bool,
    }

    impl Transport for Recorder {
        fn send(&mut self, peer: PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Send("link down".into()));
            }
            let message = SyncMessage::decode(&bytes, &ValidationLimits::default())
                .map_err(|err| TransportError::Send(err.to_string()))?;
            self.sent.push((peer, message));
            Ok(())
        }
    }

    fn engine() -> SyncEngine {
        SyncEngine::new(SyncConfig::default(), ValidationLimits::default())
    }

    fn log_with(replica: u64, count: u64) -> OpLog {
        let mut log = OpLog::new();
        for counter in 1..=count {
            log.insert(SequenceOp::Insert {
                id: OpId::new(replica, counter),
                value: 'x',
                origin_left: (counter > 1).then(|| OpId::new(replica, counter - 1)),
                origin_right: None,
            });
        }
        log
    }

    fn encode(message: &SyncMessage) -> Vec<u8> {
        message.encode().unwrap()
    }

    #[test]
    fn test_connect_sends_state_vector() {
        let now = Instant::now();
        let peer = Uuid::new_v4();
        let mut transport = Recorder::default();
        let mut engine = engine();

        engine.peer_connected(peer, &log_with(1, 2), &mut transport, now);

        assert_eq!(engine.state(&peer), PeerState::Handshaking);
        assert!(matches!(
            &transport.sent[0].1,
            SyncMessage::StateVector { vector } if vector.counter(1) == 2
        ));
    }

    #[test]
    fn test_vector_reply_carries_missing_ops() {
        let now = Instant::now();
        let peer = Uuid::new_v4();
        let mut transport = Recorder::default();
        let mut engine = engine();
        let log = log_with(1, 3);

        let mut remote = crate::core::StateVector::new();
        remote.set(1, 1);
        let inbound = engine.receive(
            peer,
            &encode(&SyncMessage::StateVector { vector: remote }),
            &log,
            &mut transport,
            now,
        );

        assert_eq!(inbound, Inbound::None);
        // Implicit handshake: our vector first, then the two missing ops.
        assert_eq!(transport.sent.len(), 2);
        match &transport.sent[1].1 {
            SyncMessage::OperationBatch { ops } => assert_eq!(ops.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        // The peer's vector is covered, so nothing is owed to us.
        assert_eq!(engine.state(&peer), PeerState::Synced);
    }

    #[test]
    fn test_batch_completes_handshake() {
        let now = Instant::now();
        let peer = Uuid::new_v4();
        let mut transport = Recorder::default();
        let mut engine = engine();
        let log = OpLog::new();

        engine.peer_connected(peer, &log, &mut transport, now);
        let remote = log_with(2, 1);
        engine.receive(
            peer,
            &encode(&SyncMessage::StateVector {
                vector: remote.state_vector().clone(),
            }),
            &log,
            &mut transport,
            now,
        );
        assert_eq!(engine.state(&peer), PeerState::Handshaking);

        let ops: Vec<Operation> = remote.iter().cloned().collect();
        let inbound = engine.receive(
            peer,
            &encode(&SyncMessage::OperationBatch { ops: ops.clone() }),
            &log,
            &mut transport,
            now,
        );
        assert_eq!(inbound, Inbound::Operations(ops));
        assert_eq!(engine.state(&peer), PeerState::Synced);
        assert_eq!(engine.synced_peers().collect::<Vec<_>>(), vec![peer]);
    }

    #[test]
    fn test_broadcast_skips_disconnected_peers() {
        let now = Instant::now();
        let (live, gone) = (Uuid::new_v4(), Uuid::new_v4());
        let mut transport = Recorder::default();
        let mut engine = engine();
        let log = OpLog::new();

        for peer in [live, gone] {
            engine.peer_connected(peer, &log, &mut transport, now);
            engine.receive(
                peer,
                &encode(&SyncMessage::StateVector {
                    vector: log.state_vector().clone(),
                }),
                &log,
                &mut transport,
                now,
            );
        }
        engine.peer_disconnected(gone);
        transport.sent.clear();

        let ops: Vec<Operation> = log_with(1, 1).iter().cloned().collect();
        engine.broadcast_ops(&ops, &mut transport);

        assert_eq!(transport.sent.len(), 1);
        assert_eq!(transport.sent[0].0, live);
    }

    #[test]
    fn test_send_failure_disconnects() {
        let now = Instant::now();
        let peer = Uuid::new_v4();
        let mut transport = Recorder {
            fail: true,
            ..Default::default()
        };
        let mut engine = engine();

        engine.peer_connected(peer, &OpLog::new(), &mut transport, now);
        assert_eq!(engine.state(&peer), PeerState::Disconnected);
    }

    #[test]
    fn test_awareness_is_passed_through() {
        let now = Instant::now();
        let update = AwarenessUpdate {
            replica: 5,
            clock: 1,
            state: serde_json::json!({"user": {"name": "x", "color": "#000000"}}),
        };
        let mut engine = engine();
        let inbound = engine.receive(
            Uuid::new_v4(),
            &encode(&SyncMessage::Awareness(update.clone())),
            &OpLog::new(),
            &mut Recorder::default(),
            now,
        );
        assert_eq!(inbound, Inbound::Awareness(update));
    }

    fn batch_sizes(sent: &[(PeerId, SyncMessage)]) -> Vec<usize> {
        sent.iter()
            .filter_map(|(_, message)| match message {
                SyncMessage::OperationBatch { ops } => Some(ops.len()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_missing_ops_are_split_to_fit_limits() {
        let now = Instant::now();
        let peer = Uuid::new_v4();
        let mut transport = Recorder::default();
        let limits = ValidationLimits {
            max_ops_per_message: 4,
            ..Default::default()
        };
        let mut engine = SyncEngine::new(SyncConfig::default(), limits);
        let log = log_with(1, 10);

        engine.receive(
            peer,
            &encode(&SyncMessage::StateVector {
                vector: crate::core::StateVector::new(),
            }),
            &log,
            &mut transport,
            now,
        );

        assert_eq!(batch_sizes(&transport.sent), vec![4, 4, 2]);
        assert_eq!(engine.state(&peer), PeerState::Synced);
    }

    #[test]
    fn test_failed_chunk_leaves_batch_unsent() {
        let now = Instant::now();
        let peer = Uuid::new_v4();
        let mut transport = Recorder::default();
        let limits = ValidationLimits {
            max_ops_per_message: 2,
            ..Default::default()
        };
        let mut engine = SyncEngine::new(SyncConfig::default(), limits);
        let log = log_with(1, 5);

        engine.peer_connected(peer, &log, &mut transport, now);
        transport.fail = true;
        engine.receive(
            peer,
            &encode(&SyncMessage::StateVector {
                vector: crate::core::StateVector::new(),
            }),
            &log,
            &mut transport,
            now,
        );

        assert_eq!(engine.state(&peer), PeerState::Disconnected);
        assert!(!engine.connection(&peer).unwrap().accepts_broadcast());
    }

    #[test]
    fn test_broadcast_is_split_to_fit_limits() {
        let now = Instant::now();
        let peer = Uuid::new_v4();
        let mut transport = Recorder::default();
        let limits = ValidationLimits {
            max_ops_per_message: 3,
            ..Default::default()
        };
        let mut engine = SyncEngine::new(SyncConfig::default(), limits);
        let log = OpLog::new();

        engine.peer_connected(peer, &log, &mut transport, now);
        engine.receive(
            peer,
            &encode(&SyncMessage::StateVector {
                vector: log.state_vector().clone(),
            }),
            &log,
            &mut transport,
            now,
        );
        transport.sent.clear();

        let ops: Vec<Operation> = log_with(2, 7).iter().cloned().collect();
        engine.broadcast_ops(&ops, &mut transport);

        assert_eq!(batch_sizes(&transport.sent), vec![3, 3, 1]);
    }
}
