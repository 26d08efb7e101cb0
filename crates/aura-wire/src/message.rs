//! Inbound message decode
//!
//! Every datagram the mixer consumes is decoded into one case of the
//! closed `Message` enum before any handler runs, so unknown kinds and
//! version skew are surfaced exactly once, at the edge.

use aura_core::{AuraError, AuraResult, NodeId};

use crate::{ByteReader, KillReason, PacketKind};

/// One decoded inbound packet.
#[derive(Debug)]
pub struct Inbound {
    /// Sender UUID from the header; `None` for non-sourced kinds, whose
    /// sending mixer is identified by socket address instead.
    pub sender: Option<NodeId>,
    pub message: Message,
}

/// Decoded payload of every packet kind the mixer consumes.
#[derive(Debug)]
pub enum Message {
    /// Whole-payload avatar state replacement. Opaque past the sort prefix.
    AvatarData { payload: Vec<u8> },
    /// Identity bytes, decoded by the avatars layer in pass 1.
    AvatarIdentity { payload: Vec<u8> },
    /// Request for another avatar's current identity.
    AvatarIdentityRequest { avatar: NodeId },
    /// Trait stream updates, decoded by the avatars layer in pass 1.
    SetAvatarTraits { payload: Vec<u8> },
    /// Acknowledges bulk traits up to an outgoing sequence.
    BulkAvatarTraitsAck { seq: u64 },
    /// Sender is leaving, or an admin removed an avatar.
    KillAvatar { avatar: NodeId, reason: KillReason },
    /// Toggle ignore entries for the listed ids.
    NodeIgnoreRequest { add: bool, ids: Vec<NodeId> },
    /// Toggle the radius-ignore bubble.
    RadiusIgnoreRequest { enabled: bool },
    /// PAL open/close.
    RequestsDomainListData { requesting: bool },
    /// Recipient view: origin and look direction.
    AvatarQuery {
        origin: [f32; 3],
        direction: [f32; 3],
    },
    /// Admin-gated sort weight replacement.
    AdjustAvatarSorting { size: f32, center: f32, age: f32 },
    /// Identity mirrored from an upstream mixer.
    ReplicatedAvatarIdentity { avatar: NodeId, payload: Vec<u8> },
    /// Kill mirrored from an upstream mixer.
    ReplicatedKillAvatar { avatar: NodeId, reason: KillReason },
    /// Bulk avatar data mirrored from an upstream mixer; one segment per
    /// replicated avatar.
    ReplicatedBulkAvatarData { segments: Vec<(NodeId, Vec<u8>)> },
}

impl Message {
    /// Decode one datagram. Returns the header sender (for sourced kinds)
    /// and the decoded message.
    pub fn parse(buf: &[u8]) -> AuraResult<Inbound> {
        let mut reader = ByteReader::new(buf);

        let tag = reader.read_u8()?;
        let kind = PacketKind::from_byte(tag).ok_or(AuraError::UnknownPacketKind(tag))?;

        let version = reader.read_u8()?;
        if version != kind.current_version() {
            return Err(AuraError::VersionMismatch {
                kind: tag,
                version,
            });
        }

        let sender = if kind.is_sourced() {
            Some(reader.read_node_id()?)
        } else {
            None
        };

        let message = match kind {
            PacketKind::AvatarData => Message::AvatarData {
                payload: reader.read_rest().to_vec(),
            },
            PacketKind::AvatarIdentity => Message::AvatarIdentity {
                payload: reader.read_rest().to_vec(),
            },
            PacketKind::AvatarIdentityRequest => Message::AvatarIdentityRequest {
                avatar: reader.read_node_id()?,
            },
            PacketKind::SetAvatarTraits => Message::SetAvatarTraits {
                payload: reader.read_rest().to_vec(),
            },
            PacketKind::BulkAvatarTraitsAck => Message::BulkAvatarTraitsAck {
                seq: reader.read_u64()?,
            },
            PacketKind::KillAvatar => {
                let avatar = reader.read_node_id()?;
                let reason = KillReason::from_byte(reader.read_u8()?)
                    .ok_or(AuraError::MalformedPacket("unknown kill reason"))?;
                Message::KillAvatar { avatar, reason }
            }
            PacketKind::NodeIgnoreRequest => {
                let add = reader.read_bool()?;
                let mut ids = Vec::new();
                while !reader.is_empty() {
                    ids.push(reader.read_node_id()?);
                }
                if ids.is_empty() {
                    return Err(AuraError::MalformedPacket("ignore request with no ids"));
                }
                Message::NodeIgnoreRequest { add, ids }
            }
            PacketKind::RadiusIgnoreRequest => Message::RadiusIgnoreRequest {
                enabled: reader.read_bool()?,
            },
            PacketKind::RequestsDomainListData => Message::RequestsDomainListData {
                requesting: reader.read_bool()?,
            },
            PacketKind::AvatarQuery => {
                let mut origin = [0.0f32; 3];
                let mut direction = [0.0f32; 3];
                for v in &mut origin {
                    *v = reader.read_f32()?;
                }
                for v in &mut direction {
                    *v = reader.read_f32()?;
                }
                Message::AvatarQuery { origin, direction }
            }
            PacketKind::AdjustAvatarSorting => Message::AdjustAvatarSorting {
                size: reader.read_f32()?,
                center: reader.read_f32()?,
                age: reader.read_f32()?,
            },
            PacketKind::ReplicatedAvatarIdentity => Message::ReplicatedAvatarIdentity {
                avatar: reader.read_node_id()?,
                payload: reader.read_rest().to_vec(),
            },
            PacketKind::ReplicatedKillAvatar => {
                let avatar = reader.read_node_id()?;
                let reason = KillReason::from_byte(reader.read_u8()?)
                    .ok_or(AuraError::MalformedPacket("unknown kill reason"))?;
                Message::ReplicatedKillAvatar { avatar, reason }
            }
            PacketKind::ReplicatedBulkAvatarData => {
                let mut segments = Vec::new();
                while !reader.is_empty() {
                    let avatar = reader.read_node_id()?;
                    let bytes = reader.read_prefixed_bytes()?.to_vec();
                    segments.push((avatar, bytes));
                }
                Message::ReplicatedBulkAvatarData { segments }
            }
            // outbound-only kinds are never consumed
            PacketKind::BulkAvatarData | PacketKind::BulkAvatarTraits => {
                return Err(AuraError::MalformedPacket("outbound-only packet kind"));
            }
        };

        Ok(Inbound { sender, message })
    }

    /// The wire kind this message decoded from.
    pub fn kind(&self) -> PacketKind {
        match self {
            Message::AvatarData { .. } => PacketKind::AvatarData,
            Message::AvatarIdentity { .. } => PacketKind::AvatarIdentity,
            Message::AvatarIdentityRequest { .. } => PacketKind::AvatarIdentityRequest,
            Message::SetAvatarTraits { .. } => PacketKind::SetAvatarTraits,
            Message::BulkAvatarTraitsAck { .. } => PacketKind::BulkAvatarTraitsAck,
            Message::KillAvatar { .. } => PacketKind::KillAvatar,
            Message::NodeIgnoreRequest { .. } => PacketKind::NodeIgnoreRequest,
            Message::RadiusIgnoreRequest { .. } => PacketKind::RadiusIgnoreRequest,
            Message::RequestsDomainListData { .. } => PacketKind::RequestsDomainListData,
            Message::AvatarQuery { .. } => PacketKind::AvatarQuery,
            Message::AdjustAvatarSorting { .. } => PacketKind::AdjustAvatarSorting,
            Message::ReplicatedAvatarIdentity { .. } => PacketKind::ReplicatedAvatarIdentity,
            Message::ReplicatedKillAvatar { .. } => PacketKind::ReplicatedKillAvatar,
            Message::ReplicatedBulkAvatarData { .. } => PacketKind::ReplicatedBulkAvatarData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PacketWriter;

    #[test]
    fn test_parse_kill_avatar() {
        let sender = NodeId::random();
        let victim = NodeId::random();
        let mut writer = PacketWriter::new(PacketKind::KillAvatar, sender);
        writer.write_node_id(victim);
        writer.write_u8(KillReason::Disconnected.to_byte());
        let packet = writer.finish();

        let inbound = Message::parse(&packet.bytes).unwrap();
        assert_eq!(inbound.sender, Some(sender));
        match inbound.message {
            Message::KillAvatar { avatar, reason } => {
                assert_eq!(avatar, victim);
                assert_eq!(reason, KillReason::Disconnected);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ignore_request_multiple_ids() {
        let sender = NodeId::random();
        let a = NodeId::random();
        let b = NodeId::random();
        let mut writer = PacketWriter::new(PacketKind::NodeIgnoreRequest, sender);
        writer.write_bool(true);
        writer.write_node_id(a);
        writer.write_node_id(b);
        let packet = writer.finish();

        let inbound = Message::parse(&packet.bytes).unwrap();
        match inbound.message {
            Message::NodeIgnoreRequest { add, ids } => {
                assert!(add);
                assert_eq!(ids, vec![a, b]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch_detected() {
        let sender = NodeId::random();
        let mut packet = PacketWriter::new(PacketKind::AvatarData, sender).finish();
        packet.bytes[1] = packet.bytes[1].wrapping_add(1);
        assert!(matches!(
            Message::parse(&packet.bytes),
            Err(AuraError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let buf = [0xEEu8, 1];
        assert!(matches!(
            Message::parse(&buf),
            Err(AuraError::UnknownPacketKind(0xEE))
        ));
    }

    #[test]
    fn test_replicated_bulk_segments() {
        let a = NodeId::random();
        let b = NodeId::random();
        let mut writer = PacketWriter::new(PacketKind::ReplicatedBulkAvatarData, NodeId::NIL);
        writer.write_node_id(a);
        writer.write_prefixed_bytes(&[1, 2, 3]);
        writer.write_node_id(b);
        writer.write_prefixed_bytes(&[9]);
        let packet = writer.finish();

        let inbound = Message::parse(&packet.bytes).unwrap();
        assert_eq!(inbound.sender, None);
        match inbound.message {
            Message::ReplicatedBulkAvatarData { segments } => {
                assert_eq!(segments.len(), 2);
                assert_eq!(segments[0], (a, vec![1, 2, 3]));
                assert_eq!(segments[1], (b, vec![9]));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_replicated_bulk_errors() {
        let a = NodeId::random();
        let mut writer = PacketWriter::new(PacketKind::ReplicatedBulkAvatarData, NodeId::NIL);
        writer.write_node_id(a);
        writer.write_u16(50);
        writer.write_bytes(&[0; 10]);
        let packet = writer.finish();
        assert!(Message::parse(&packet.bytes).is_err());
    }

    #[test]
    fn test_empty_avatar_data_parses() {
        // the version-mismatch echo is an AvatarData packet with no payload
        let packet = PacketWriter::new(PacketKind::AvatarData, NodeId::random()).finish();
        let inbound = Message::parse(&packet.bytes).unwrap();
        match inbound.message {
            Message::AvatarData { payload } => assert!(payload.is_empty()),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
