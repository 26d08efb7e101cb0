//! Identity types for the AURA mixer
//!
//! Node ids are full RFC 4122 UUIDs on the wire; the registry additionally
//! assigns each live node a dense 16-bit local id used to key per-peer
//! bookkeeping tables cheaply.

use std::fmt;

use uuid::Uuid;

/// Number of bytes a node id occupies on the wire.
pub const NODE_ID_WIRE_SIZE: usize = 16;

/// Node identity - an RFC 4122 UUID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub const NIL: NodeId = NodeId(Uuid::nil());

    #[inline]
    pub fn new(id: Uuid) -> Self {
        NodeId(id)
    }

    /// Generate a fresh random node id.
    pub fn random() -> Self {
        NodeId(Uuid::new_v4())
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.0.is_nil()
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; NODE_ID_WIRE_SIZE] {
        *self.0.as_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; NODE_ID_WIRE_SIZE]) -> Self {
        NodeId(Uuid::from_bytes(bytes))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense per-session node id assigned by the registry.
///
/// Zero is the null sentinel and is never assigned to a live node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LocalId(pub u16);

impl LocalId {
    pub const NULL: LocalId = LocalId(0);

    #[inline]
    pub fn new(id: u16) -> Self {
        LocalId(id)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        LocalId(u16::from_le_bytes(bytes))
    }
}

impl fmt::Debug for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Local({})", self.0)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_roundtrip() {
        let id = NodeId::random();
        let bytes = id.to_bytes();
        let recovered = NodeId::from_bytes(bytes);
        assert_eq!(id, recovered);
    }

    #[test]
    fn test_nil_node_id() {
        assert!(NodeId::NIL.is_nil());
        assert!(!NodeId::random().is_nil());
    }

    #[test]
    fn test_local_id_null_sentinel() {
        assert!(LocalId::NULL.is_null());
        assert!(!LocalId::new(1).is_null());
    }

    #[test]
    fn test_local_id_roundtrip() {
        let id = LocalId::new(0xBEEF);
        assert_eq!(LocalId::from_bytes(id.to_bytes()), id);
    }
}
