//! In-memory mesh of sessions for exercising the protocol end to end.
//!
//! Messages are routed through [`MemoryTransport`] queues and delivered in
//! rounds; a seeded RNG decides which ones get lost or duplicated, so every
//! run is reproducible from its seed.

use crate::awareness::{Presence, UserInfo};
use crate::binding::{Delta, TextBuffer};
use crate::config::Config;
use crate::error::Error;
use crate::session::Session;
use crate::sync::{PeerId, Transport, TransportError};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Transport that queues outbound messages for the mesh to route.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    outbox: Vec<(PeerId, Vec<u8>)>,
    links: BTreeSet<PeerId>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&mut self, peer: PeerId) {
        self.links.insert(peer);
    }

    pub fn unlink(&mut self, peer: PeerId) {
        self.links.remove(&peer);
        self.outbox.retain(|(to, _)| *to != peer);
    }

    pub fn is_linked(&self, peer: &PeerId) -> bool {
        self.links.contains(peer)
    }

    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    pub fn drain(&mut self) -> Vec<(PeerId, Vec<u8>)> {
        std::mem::take(&mut self.outbox)
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, peer: PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.links.contains(&peer) {
            return Err(TransportError::NotConnected(peer));
        }
        self.outbox.push((peer, bytes));
        Ok(())
    }
}

/// Parameters of one simulated editing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub replicas: usize,
    pub edits: usize,
    pub drop_rate: f64,
    pub duplicate_rate: f64,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            edits: 200,
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MeshStats {
    pub delivered: usize,
    pub dropped: usize,
    pub duplicated: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub replicas: usize,
    pub edits: usize,
    pub seed: u64,
    pub stats: MeshStats,
    pub converged: bool,
    pub length: usize,
    pub text: String,
    pub peers_seen: Vec<usize>,
}

struct Node {
    peer: PeerId,
    session: Session<MemoryTransport, TextBuffer>,
}

pub struct Mesh {
    nodes: Vec<Node>,
    index: BTreeMap<PeerId, usize>,
    rng: ChaCha8Rng,
    drop_rate: f64,
    duplicate_rate: f64,
    stats: MeshStats,
    now: Instant,
}

impl Mesh {
    pub fn new(replicas: usize, config: &Config, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let now = Instant::now();
        let mut nodes = Vec::with_capacity(replicas);
        let mut index = BTreeMap::new();

        for i in 0..replicas {
            let replica = rng.gen_range(1..u64::MAX);
            let peer = Uuid::from_u64_pair(rng.next_u64(), rng.next_u64());
            let mut session =
                Session::new(replica, config, MemoryTransport::new(), TextBuffer::new());
            let presence = Presence::new(UserInfo::new(format!("user-{i}"), replica));
            session.set_presence(presence.to_value(), now);
            index.insert(peer, i);
            nodes.push(Node { peer, session });
        }

        Self {
            nodes,
            index,
            rng,
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            stats: MeshStats::default(),
            now,
        }
    }

    /// Sets the loss and duplication probabilities, clamped to `[0, 1]`.
    pub fn set_faults(&mut self, drop_rate: f64, duplicate_rate: f64) {
        self.drop_rate = drop_rate.clamp(0.0, 1.0);
        self.duplicate_rate = duplicate_rate.clamp(0.0, 1.0);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn session(&self, node: usize) -> &Session<MemoryTransport, TextBuffer> {
        &self.nodes[node].session
    }

    pub fn session_mut(&mut self, node: usize) -> &mut Session<MemoryTransport, TextBuffer> {
        &mut self.nodes[node].session
    }

    pub fn peer_id(&self, node: usize) -> PeerId {
        self.nodes[node].peer
    }

    pub fn connect(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let (peer_a, peer_b) = (self.nodes[a].peer, self.nodes[b].peer);
        let now = self.now;
        self.nodes[a].session.transport_mut().link(peer_b);
        self.nodes[b].session.transport_mut().link(peer_a);
        self.nodes[a].session.peer_connected(peer_b, now);
        self.nodes[b].session.peer_connected(peer_a, now);
    }

    pub fn disconnect(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let (peer_a, peer_b) = (self.nodes[a].peer, self.nodes[b].peer);
        self.nodes[a].session.transport_mut().unlink(peer_b);
        self.nodes[b].session.transport_mut().unlink(peer_a);
        self.nodes[a].session.peer_disconnected(peer_b);
        self.nodes[b].session.peer_disconnected(peer_a);
    }

    pub fn connect_all(&mut self) {
        for a in 0..self.nodes.len() {
            for b in (a + 1)..self.nodes.len() {
                self.connect(a, b);
            }
        }
    }

    pub fn isolate(&mut self, node: usize) {
        for other in 0..self.nodes.len() {
            self.disconnect(node, other);
        }
    }

    pub fn rejoin(&mut self, node: usize) {
        for other in 0..self.nodes.len() {
            self.connect(node, other);
        }
    }

    pub fn edit(&mut self, node: usize, delta: Delta) -> Result<(), Error> {
        self.nodes[node].session.edit(delta)?;
        Ok(())
    }

    /// A random insert or delete at a random position of `node`'s text.
    pub fn random_edit(&mut self, node: usize) -> Result<(), Error> {
        let len = self.nodes[node].session.document().len_visible();
        let delta = if len > 0 && self.rng.gen_bool(0.3) {
            let position = self.rng.gen_range(0..len);
            let length = self.rng.gen_range(1..=(len - position).min(3));
            Delta::Delete { position, length }
        } else {
            let position = self.rng.gen_range(0..=len);
            let count = self.rng.gen_range(1..=3);
            let text: String = (0..count)
                .map(|_| char::from(b'a' + self.rng.gen_range(0..26u8)))
                .collect();
            Delta::Insert { position, text }
        };
        self.edit(node, delta)
    }

    /// Delivers every queued message once. Returns how many were handed
    /// to a receiver.
    pub fn step(&mut self) -> usize {
        let now = self.now;
        let mut batches = Vec::new();
        for (from, node) in self.nodes.iter_mut().enumerate() {
            for (to, bytes) in node.session.transport_mut().drain() {
                batches.push((from, to, bytes));
            }
        }

        let mut delivered = 0;
        for (from, to, bytes) in batches {
            let Some(&target) = self.index.get(&to) else {
                continue;
            };
            if self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate) {
                self.stats.dropped += 1;
                continue;
            }
            let copies = if self.duplicate_rate > 0.0 && self.rng.gen_bool(self.duplicate_rate) {
                self.stats.duplicated += 1;
                2
            } else {
                1
            };
            let sender = self.nodes[from].peer;
            for _ in 0..copies {
                self.nodes[target].session.receive(sender, &bytes, now);
                delivered += 1;
            }
        }
        self.stats.delivered += delivered;
        delivered
    }

    /// Runs delivery rounds until no messages are in flight.
    pub fn deliver_until_quiet(&mut self, max_rounds: usize) -> usize {
        let mut rounds = 0;
        while rounds < max_rounds && self.in_flight() > 0 {
            self.step();
            rounds += 1;
        }
        rounds
    }

    pub fn in_flight(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| node.session.transport().pending())
            .sum()
    }

    /// Moves the simulated clock forward and runs every session's tick.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        let now = self.now;
        for node in &mut self.nodes {
            node.session.tick(now);
        }
    }

    /// Turns faults off and reconnects every pair, forcing a full
    /// handshake everywhere.
    pub fn heal(&mut self) {
        self.set_faults(0.0, 0.0);
        for a in 0..self.nodes.len() {
            for b in (a + 1)..self.nodes.len() {
                self.disconnect(a, b);
                self.connect(a, b);
            }
        }
        self.deliver_until_quiet(64);
    }

    pub fn texts(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.session.text()).collect()
    }

    /// Every replica holds the same text and its editor mirrors it.
    pub fn converged(&self) -> bool {
        let Some(first) = self.nodes.first() else {
            return true;
        };
        let text = first.session.text();
        self.nodes.iter().all(|node| {
            let own = node.session.text();
            own == text && crate::binding::Editor::buffer(node.session.editor()) == own
        })
    }
}

/// Connects `config.replicas` sessions, applies random edits under the
/// configured faults, partitions one replica halfway through, then heals
/// the mesh and checks convergence.
pub fn run(config: &SimulationConfig, crdt: &Config) -> Result<SimulationReport, Error> {
    let mut mesh = Mesh::new(config.replicas, crdt, config.seed);
    mesh.connect_all();
    mesh.deliver_until_quiet(64);
    mesh.set_faults(config.drop_rate, config.duplicate_rate);

    let partition_at = config.edits / 2;
    let rejoin_at = config.edits * 3 / 4;
    for i in 0..config.edits {
        if mesh.is_empty() {
            break;
        }
        if mesh.len() > 1 && i == partition_at {
            debug!(node = 0, "partitioning replica");
            mesh.isolate(0);
        }
        if mesh.len() > 1 && i == rejoin_at {
            debug!(node = 0, "rejoining replica");
            mesh.rejoin(0);
        }
        let count = mesh.len();
        let node = mesh.rng.gen_range(0..count);
        mesh.random_edit(node)?;
        mesh.step();
    }

    mesh.deliver_until_quiet(64);
    mesh.advance(crdt.sync.resync_interval());
    mesh.deliver_until_quiet(64);
    mesh.heal();

    let converged = mesh.converged();
    let text = mesh.texts().into_iter().next().unwrap_or_default();
    info!(
        converged,
        delivered = mesh.stats.delivered,
        dropped = mesh.stats.dropped,
        "simulation finished"
    );

    Ok(SimulationReport {
        replicas: config.replicas,
        edits: config.edits,
        seed: config.seed,
        stats: mesh.stats.clone(),
        converged,
        length: text.chars().count(),
        text,
        peers_seen: (0..mesh.len())
            .map(|node| mesh.session(node).awareness().len())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lossless_mesh_converges() {
        let mut mesh = Mesh::new(3, &Config::default(), 7);
        mesh.connect_all();
        for i in 0..30 {
            mesh.random_edit(i % 3).unwrap();
            mesh.step();
        }
        mesh.deliver_until_quiet(64);
        assert!(mesh.converged(), "{:?}", mesh.texts());
    }

    #[test]
    fn test_send_to_unlinked_peer_fails() {
        let mut transport = MemoryTransport::new();
        let peer = Uuid::new_v4();
        assert_eq!(
            transport.send(peer, vec![1]),
            Err(TransportError::NotConnected(peer))
        );
        transport.link(peer);
        assert!(transport.send(peer, vec![1]).is_ok());
        assert_eq!(transport.pending(), 1);
    }

    #[test]
    fn test_isolated_replica_catches_up_on_rejoin() {
        let mut mesh = Mesh::new(2, &Config::default(), 1);
        mesh.connect_all();
        mesh.deliver_until_quiet(64);

        mesh.isolate(1);
        mesh.edit(
            0,
            Delta::Insert {
                position: 0,
                text: "offline".into(),
            },
        )
        .unwrap();
        mesh.deliver_until_quiet(64);
        assert_eq!(mesh.session(1).text(), "");

        mesh.rejoin(1);
        mesh.deliver_until_quiet(64);
        assert_eq!(mesh.session(1).text(), "offline");
    }

    #[test]
    fn test_run_with_faults_converges_after_heal() {
        let config = SimulationConfig {
            replicas: 4,
            edits: 120,
            drop_rate: 0.2,
            duplicate_rate: 0.1,
            seed: 42,
        };
        let report = run(&config, &Config::default()).unwrap();
        assert!(report.converged);
        assert!(report.stats.dropped > 0);
    }

    #[test]
    fn test_same_seed_same_result() {
        let config = SimulationConfig {
            edits: 50,
            seed: 9,
            ..Default::default()
        };
        let first = run(&config, &Config::default()).unwrap();
        let second = run(&config, &Config::default()).unwrap();
        assert_eq!(first.text, second.text);
    }
}
