//! mesh-crdt: collaborative plain-text editing over a peer-to-peer mesh.
//!
//! Every replica holds a full copy of the document as a YATA-style sequence
//! CRDT, so concurrent edits merge deterministically without a server. The
//! crate is organized in layers:
//!
//! - **Core CRDT** - operation ids, state vectors, and the text sequence
//! - **Sync protocol** - state-vector handshake, per-peer connection state,
//!   broadcast of live operations, message validation
//! - **Awareness** - ephemeral presence (names, colors, cursors) with expiry
//! - **Binding** - editor glue that keeps the local cursor stable
//! - **Session** - one replica wiring all of the above to a transport
//! - **Simulation** - an in-memory lossy mesh (optional)
//!
//! # Quick Start
//!
//! ```rust
//! use mesh_crdt::core::{IdAllocator, Sequence};
//!
//! let mut alice = Sequence::new();
//! let mut alloc = IdAllocator::new(1);
//! let ops = alice.local_insert_run(&mut alloc, 0, "hi".chars()).unwrap();
//!
//! let mut bob = Sequence::new();
//! for op in ops {
//!     bob.apply_remote(op).unwrap();
//! }
//! assert_eq!(bob.to_text(), "hi");
//! ```
//!
//! # Features
//!
//! - `sim` - In-memory transport and mesh simulation
//! - `cli` - The `mesh-crdt` binary (requires `sim`)

// Core CRDT algorithms
pub mod core;

// Synchronization protocol
pub mod sync;

pub mod awareness;
pub mod binding;
pub mod config;
pub mod error;
pub mod session;

#[cfg(feature = "sim")]
pub mod simulation;

pub use core::{IdAllocator, OpId, ReplicaId, Sequence, SequenceOp, StateVector};

pub use sync::{
    DecodeError, OpLog, Operation, PeerId, PeerState, SyncConfig, SyncEngine, SyncMessage,
    Transport, TransportError, ValidationLimits,
};

pub use awareness::{Awareness, AwarenessChange, AwarenessConfig, AwarenessUpdate, Presence};
pub use binding::{Anchor, Binding, Delta, Editor, TextBuffer};
pub use config::{Config, ConfigError};
pub use error::{Error, Result};
pub use session::Session;

#[cfg(feature = "sim")]
pub use simulation::{Mesh, MemoryTransport, SimulationConfig, SimulationReport};
