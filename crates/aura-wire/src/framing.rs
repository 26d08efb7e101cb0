//! Outbound packet framing
//!
//! Layout of every AURA datagram:
//! - Byte 0: kind tag
//! - Byte 1: version
//! - Bytes 2..18: sender UUID (sourced kinds only)
//! - Payload

use aura_core::NodeId;

use crate::PacketKind;

/// Header size for sourced packet kinds.
pub const SOURCED_HEADER_SIZE: usize = 18;

/// Header size for non-sourced (replicated) packet kinds.
pub const BARE_HEADER_SIZE: usize = 2;

/// MTU-friendly ceiling for a single datagram.
pub const MAX_PACKET_SIZE: usize = 1400;

/// A framed outbound packet ready for a transport sink.
#[derive(Clone, Debug)]
pub struct WirePacket {
    pub kind: PacketKind,
    pub bytes: Vec<u8>,
}

impl WirePacket {
    /// Payload length, excluding the header.
    pub fn payload_len(&self) -> usize {
        self.bytes.len() - header_size(self.kind)
    }
}

fn header_size(kind: PacketKind) -> usize {
    if kind.is_sourced() {
        SOURCED_HEADER_SIZE
    } else {
        BARE_HEADER_SIZE
    }
}

/// Builder for a single framed packet.
pub struct PacketWriter {
    kind: PacketKind,
    buf: Vec<u8>,
}

impl PacketWriter {
    /// Start a packet. `sender` is required for sourced kinds and ignored
    /// for non-sourced ones.
    pub fn new(kind: PacketKind, sender: NodeId) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.push(kind.to_byte());
        buf.push(kind.current_version());
        if kind.is_sourced() {
            buf.extend_from_slice(&sender.to_bytes());
        }
        PacketWriter { kind, buf }
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(v as u8);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_node_id(&mut self, id: NodeId) -> &mut Self {
        self.buf.extend_from_slice(&id.to_bytes());
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Write a u16 length prefix followed by the bytes.
    pub fn write_prefixed_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        debug_assert!(bytes.len() <= u16::MAX as usize);
        self.write_u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn write_prefixed_str(&mut self, s: &str) -> &mut Self {
        self.write_prefixed_bytes(s.as_bytes())
    }

    /// Bytes written so far, header included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() <= header_size(self.kind)
    }

    fn finish_len(&self) -> usize {
        self.buf.len() - header_size(self.kind)
    }

    pub fn finish(self) -> WirePacket {
        WirePacket {
            kind: self.kind,
            bytes: self.buf,
        }
    }
}

/// Builder for reliable list packets (identity, bulk traits).
///
/// Items are kept whole: an item that would push the current fragment past
/// `MAX_PACKET_SIZE` starts a new fragment. Identity and trait items are
/// far below the MTU individually, so this never strands an item.
pub struct ListPacketWriter {
    kind: PacketKind,
    sender: NodeId,
    fragments: Vec<WirePacket>,
    current: PacketWriter,
}

impl ListPacketWriter {
    pub fn new(kind: PacketKind, sender: NodeId) -> Self {
        ListPacketWriter {
            kind,
            sender,
            fragments: Vec::new(),
            current: PacketWriter::new(kind, sender),
        }
    }

    /// Append one whole item to the list.
    pub fn write_item(&mut self, item: &[u8]) {
        if !self.current.is_empty() && self.current.len() + item.len() > MAX_PACKET_SIZE {
            let full = std::mem::replace(&mut self.current, PacketWriter::new(self.kind, self.sender));
            self.fragments.push(full.finish());
        }
        self.current.write_bytes(item);
    }

    /// Total payload bytes across all fragments so far.
    pub fn payload_len(&self) -> usize {
        let current = if self.current.is_empty() {
            0
        } else {
            self.current.finish_len()
        };
        self.fragments.iter().map(|f| f.payload_len()).sum::<usize>() + current
    }

    pub fn finish(mut self) -> Vec<WirePacket> {
        if !self.current.is_empty() {
            self.fragments.push(self.current.finish());
        }
        self.fragments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_core::NodeId;

    #[test]
    fn test_sourced_header_layout() {
        let sender = NodeId::random();
        let packet = PacketWriter::new(PacketKind::KillAvatar, sender).finish();
        assert_eq!(packet.bytes[0], PacketKind::KillAvatar.to_byte());
        assert_eq!(packet.bytes[1], PacketKind::KillAvatar.current_version());
        assert_eq!(&packet.bytes[2..18], &sender.to_bytes());
        assert_eq!(packet.payload_len(), 0);
    }

    #[test]
    fn test_bare_header_layout() {
        let packet =
            PacketWriter::new(PacketKind::ReplicatedKillAvatar, NodeId::NIL).finish();
        assert_eq!(packet.bytes.len(), BARE_HEADER_SIZE);
    }

    #[test]
    fn test_list_writer_fragments_at_mtu() {
        let sender = NodeId::random();
        let mut list = ListPacketWriter::new(PacketKind::AvatarIdentity, sender);
        let item = vec![0xAAu8; 600];
        for _ in 0..5 {
            list.write_item(&item);
        }
        let fragments = list.finish();
        assert!(fragments.len() > 1);
        for fragment in &fragments {
            assert!(fragment.bytes.len() <= MAX_PACKET_SIZE + 600);
            assert_eq!(fragment.kind, PacketKind::AvatarIdentity);
        }
        let total: usize = fragments.iter().map(|f| f.payload_len()).sum();
        assert_eq!(total, 5 * 600);
    }

    #[test]
    fn test_empty_list_produces_no_fragments() {
        let list = ListPacketWriter::new(PacketKind::BulkAvatarTraits, NodeId::random());
        assert!(list.finish().is_empty());
    }
}
