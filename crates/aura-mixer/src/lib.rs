//! AURA Mixer - the avatar state fan-out server
//!
//! A fixed-rate (45 Hz) loop receives avatar state from connected agents
//! and peer mixers, and sends every agent a personalized, interest-filtered,
//! bandwidth-bounded digest of everyone else each tick.
//!
//! Per-tick data flow:
//! frame clock -> throttle controller -> slave pool pass 1 (drain inboxes)
//! -> display-name sweep (single-threaded) -> candidate snapshot
//! -> slave pool pass 2 (filter, sort, budget, encode, send).
//!
//! Control-plane packets (ignore, radius, PAL, identity requests) mutate
//! client records directly on the receive thread and become visible to the
//! next tick's broadcast pass.

pub mod client;
pub mod clock;
pub mod config;
pub mod encode;
pub mod filter;
pub mod mixer;
pub mod names;
pub mod pool;
pub mod replication;
pub mod slave;
pub mod snapshot;
pub mod sort;
pub mod stats;
pub mod throttle;
pub mod transport;

pub use client::*;
pub use clock::*;
pub use config::*;
pub use encode::*;
pub use filter::*;
pub use mixer::*;
pub use names::*;
pub use pool::*;
pub use replication::*;
pub use slave::*;
pub use snapshot::*;
pub use sort::*;
pub use stats::*;
pub use throttle::*;
pub use transport::*;

use aura_registry::{Node, NodeRegistry};

/// A registry node carrying the mixer's per-node record.
pub type MixerNode = Node<client::ClientData>;

/// The mixer's view of the process-wide registry.
pub type Registry = NodeRegistry<client::ClientData>;
