//! AURA Avatars - payload semantics
//!
//! The mixer treats avatar state as opaque versioned bytes with a small set
//! of sort-relevant accessors (world position, bounding radius, staleness).
//! This crate owns those payload layouts:
//! - the avatar data blob and its sort prefix
//! - the identity payload (display name, skeleton URL, attachments)
//! - trait streams with per-trait sequence numbers

pub mod blob;
pub mod identity;
pub mod traits;

pub use blob::*;
pub use identity::*;
pub use traits::*;
