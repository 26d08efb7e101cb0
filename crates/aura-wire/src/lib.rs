//! AURA Wire - packet kinds, framing, and inbound message decode
//!
//! Every AURA packet begins with a one-byte kind tag and a one-byte
//! version. Sourced kinds carry the sender's RFC 4122 UUID immediately
//! after; non-sourced replicated kinds carry the *original* sender UUID at
//! the front of the payload instead, because the datagram itself arrives
//! from a peer mixer.

pub mod framing;
pub mod message;
pub mod packet;
pub mod reader;

pub use framing::*;
pub use message::*;
pub use packet::*;
pub use reader::*;
