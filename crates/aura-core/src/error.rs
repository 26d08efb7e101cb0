//! Error types for the AURA mixer

use thiserror::Error;

use crate::NodeId;

/// Core AURA errors
#[derive(Error, Debug)]
pub enum AuraError {
    // Wire errors
    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unknown packet kind: {0:#04x}")]
    UnknownPacketKind(u8),

    #[error("Version mismatch for packet kind {kind:#04x}: got {version}")]
    VersionMismatch { kind: u8, version: u8 },

    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("Unknown trait kind: {0}")]
    UnknownTraitKind(u8),

    // Registry errors
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Local id space exhausted")]
    LocalIdsExhausted,

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    // Startup errors
    #[error("Settings error: {0}")]
    Settings(String),
}

/// Result type for AURA operations
pub type AuraResult<T> = Result<T, AuraError>;
