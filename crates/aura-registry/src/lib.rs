//! AURA Registry - process-wide node membership
//!
//! The registry owns every connected node record and hands out stable
//! `Arc` handles. Iteration order within a tick is ascending node id, so
//! sweeps that depend on ordering (display-name collision resolution) are
//! deterministic.

pub mod node;
pub mod registry;

pub use node::*;
pub use registry::*;
