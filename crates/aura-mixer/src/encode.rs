//! Digest encoder
//!
//! Serializes the selected candidates for one recipient, respecting the
//! per-recipient byte budget. Identity packets go out first (reliable) for
//! any candidate whose identity sequence is ahead of what the recipient has
//! seen, then trait updates (reliable), then the avatar data segments
//! (unreliable). Only data bytes count against the budget - identity must
//! still flow when the budget is zero.

use aura_avatars::TraitMap;
use aura_core::{NodeId, Timestamp};
use aura_wire::{ListPacketWriter, PacketKind, PacketWriter, WirePacket};

use crate::{CandidateSnapshot, ClientState};

/// Outcome of encoding one recipient's digest.
#[derive(Default)]
pub struct EncodeResult {
    /// Reliable-then-unreliable packet sequence to hand to the sink.
    pub packets: Vec<WirePacket>,
    pub included: usize,
    pub over_budget: usize,
    pub data_bytes: usize,
    pub identity_bytes: usize,
    pub traits_bytes: usize,
}

/// Encode one recipient's digest for this tick.
///
/// `ranked` is the filtered, sorted, throttle-trimmed candidate list;
/// `identity_only` holds ignored-but-PAL-visible candidates. The caller
/// holds the recipient's client lock and sends the returned packets.
pub fn encode_digest(
    recipient_state: &mut ClientState,
    ranked: &[(f32, CandidateSnapshot)],
    identity_only: &[CandidateSnapshot],
    mixer_id: NodeId,
    budget_bytes: usize,
    now: Timestamp,
) -> EncodeResult {
    let mut result = EncodeResult::default();

    let mut identities = ListPacketWriter::new(PacketKind::AvatarIdentity, mixer_id);
    let mut traits = PacketWriter::new(PacketKind::BulkAvatarTraits, mixer_id);
    let mut traits_items = 0usize;
    let mut data = ListPacketWriter::new(PacketKind::BulkAvatarData, mixer_id);

    // the traits digest carries a per-recipient sequence the client acks
    let traits_seq = recipient_state.next_traits_seq;
    traits.write_u64(traits_seq);

    let mut budget_left = budget_bytes;

    for (_, candidate) in ranked {
        // identity lag is repaired regardless of the data budget
        maybe_emit_identity(recipient_state, candidate, &mut identities, &mut result);

        let segment_len = 16 + 2 + candidate.data.len();
        if segment_len > budget_left {
            result.over_budget += 1;
            continue;
        }
        budget_left -= segment_len;

        // traits ride along only with candidates that made the budget
        let fresh = candidate.traits.newer_than(
            recipient_state.sent_traits_mut(candidate.local_id),
        );
        if !fresh.is_empty() {
            let entries = TraitMap::encode_entries(&fresh);
            traits.write_node_id(candidate.node_id);
            traits.write_u8(fresh.len() as u8);
            traits.write_bytes(&entries);
            result.traits_bytes += 16 + 1 + entries.len();
            traits_items += 1;
            let sent = recipient_state.sent_traits_mut(candidate.local_id);
            for (kind, instance) in &fresh {
                sent.record(*kind, instance.version);
            }
        }

        let mut segment = Vec::with_capacity(segment_len);
        segment.extend_from_slice(&candidate.node_id.to_bytes());
        segment.extend_from_slice(&(candidate.data.len() as u16).to_le_bytes());
        segment.extend_from_slice(&candidate.data);
        data.write_item(&segment);
        result.data_bytes += segment_len;

        recipient_state.set_last_broadcast_time(candidate.local_id, now);
        result.included += 1;
    }

    for candidate in identity_only {
        maybe_emit_identity(recipient_state, candidate, &mut identities, &mut result);
    }

    result.packets.extend(identities.finish());
    if traits_items > 0 {
        recipient_state.next_traits_seq = traits_seq.wrapping_add(1);
        result.packets.push(traits.finish());
    }
    result.packets.extend(data.finish());

    result
}

fn maybe_emit_identity(
    recipient_state: &mut ClientState,
    candidate: &CandidateSnapshot,
    identities: &mut ListPacketWriter,
    result: &mut EncodeResult,
) {
    if candidate.identity_sequence == 0
        || candidate.identity_sequence
            <= recipient_state.sent_identity_version(candidate.local_id)
    {
        return;
    }

    let mut item = Vec::with_capacity(2 + candidate.identity_bytes.len());
    item.extend_from_slice(&(candidate.identity_bytes.len() as u16).to_le_bytes());
    item.extend_from_slice(&candidate.identity_bytes);
    identities.write_item(&item);
    result.identity_bytes += item.len();

    recipient_state.set_sent_identity_version(candidate.local_id, candidate.identity_sequence);
}
