//! Peer synchronization protocol.
//!
//! Replicas reconcile by exchanging [`StateVector`](crate::core::StateVector)s
//! and sending each other the operations the other side is missing. Each
//! remote peer gets its own [`PeerConnection`] state machine:
//!
//! ```text
//! Disconnected -> Handshaking -> Synced -> Disconnected
//! ```
//!
//! A reconnect simply runs a new handshake; the vector diff resends exactly
//! what was missed, so there is no separate recovery path.

use crate::core::SequenceOp;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

mod engine;
mod log;
mod message;
mod peer;

pub use engine::{Inbound, SyncEngine};
pub use log::OpLog;
pub use message::{DecodeError, SyncMessage, ValidationLimits, validate_batch};
pub use peer::{PeerConnection, PeerState};

/// Transport-level identity of a connected peer.
pub type PeerId = Uuid;

/// A text operation as it travels between replicas.
pub type Operation = SequenceOp<char>;

/// Outbound half of the transport collaborator. Inbound traffic and
/// connect/disconnect events are pushed into [`SyncEngine`] by the owner.
pub trait Transport {
    /// Queues `bytes` for `peer`. Must not block.
    fn send(&mut self, peer: PeerId, bytes: Vec<u8>) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("send failed: {0}")]
    Send(String),
}

/// Timing knobs for peer connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A connection silent for longer than this is dropped.
    pub liveness_timeout_ms: u64,
    /// How often synced peers get our state vector again.
    pub resync_interval_ms: u64,
    /// Consecutive undecodable messages tolerated before disconnecting.
    pub max_decode_errors: u32,
}

impl SyncConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 30_000,
            resync_interval_ms: 10_000,
            max_decode_errors: 3,
        }
    }
}
