//! Slave work
//!
//! The two per-tick phases a worker runs over its chunk of the node range:
//! pass 1 drains and applies queued packets, pass 2 composes and sends each
//! recipient's digest. Workers touch only their own recipient's lock plus
//! the read-only candidate snapshot, so the phases cannot deadlock.

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;
use tracing::debug;

use aura_avatars::IdentityPayload;
use aura_core::{Clock, NodeId, Timestamp};

use crate::{
    classify, encode_digest, priority_score, sort_and_throttle, CandidateSnapshot, InterestClass,
    MixerNode, PacketSink, QueuedMessage, Registry, SortWeights,
};

/// Environment shared by every slave.
pub struct SlaveShared {
    pub registry: Arc<Registry>,
    pub sink: Arc<dyn PacketSink>,
    pub weights: Arc<SortWeights>,
    pub clock: Clock,
    /// This mixer's own session id, stamped as sender on outbound packets.
    pub mixer_id: NodeId,
    /// Allowed skeleton URL prefixes; empty means unrestricted.
    pub skeleton_whitelist: Vec<String>,
    pub skeleton_replacement: String,
    /// Bounding-radius clamp derived from the domain height limits.
    pub min_bounding_radius: f32,
    pub max_bounding_radius: f32,
}

/// Per-slave counters, harvested once per stats tick.
#[derive(Clone, Copy, Debug, Default)]
pub struct SlaveStats {
    pub nodes_processed: u64,
    pub packets_processed: u64,
    pub malformed_packets: u64,
    pub nodes_broadcast: u64,
    pub others_included: u64,
    pub over_budget: u64,
    pub data_bytes: u64,
    pub traits_bytes: u64,
    pub identity_bytes: u64,
    pub drain_elapsed_us: u64,
    pub broadcast_elapsed_us: u64,
}

impl AddAssign for SlaveStats {
    fn add_assign(&mut self, other: SlaveStats) {
        self.nodes_processed += other.nodes_processed;
        self.packets_processed += other.packets_processed;
        self.malformed_packets += other.malformed_packets;
        self.nodes_broadcast += other.nodes_broadcast;
        self.others_included += other.others_included;
        self.over_budget += other.over_budget;
        self.data_bytes += other.data_bytes;
        self.traits_bytes += other.traits_bytes;
        self.identity_bytes += other.identity_bytes;
        self.drain_elapsed_us += other.drain_elapsed_us;
        self.broadcast_elapsed_us += other.broadcast_elapsed_us;
    }
}

/// Pass 1: drain each node's inbox and apply the queued packets.
pub fn process_incoming_chunk(
    nodes: &[Arc<MixerNode>],
    shared: &SlaveShared,
    stats: &mut SlaveStats,
) {
    let start = Instant::now();
    let now = shared.clock.now();

    for node in nodes {
        let Some(client) = node.client() else {
            continue;
        };
        let mut state = client.lock();
        stats.nodes_processed += 1;

        for message in state.drain_inbox() {
            stats.packets_processed += 1;
            match message {
                QueuedMessage::AvatarData(payload) => {
                    if state.avatar.apply(&payload, now).is_err() {
                        stats.malformed_packets += 1;
                        continue;
                    }
                    state
                        .avatar
                        .clamp_bounding_radius(shared.min_bounding_radius, shared.max_bounding_radius);
                }
                QueuedMessage::Identity(payload) => {
                    let Ok(mut identity) = IdentityPayload::decode(&payload) else {
                        stats.malformed_packets += 1;
                        continue;
                    };
                    apply_skeleton_whitelist(&mut identity, shared);
                    let applied = state.identity.apply(&identity, now);
                    if applied.display_name_changed {
                        state.display_name_must_change = true;
                    }
                }
                QueuedMessage::Traits(payload) => {
                    if state.traits.merge_payload(&payload).is_err() {
                        stats.malformed_packets += 1;
                    }
                }
                QueuedMessage::TraitsAck(seq) => {
                    state.acked_traits_seq = state.acked_traits_seq.max(seq);
                }
            }
        }
    }

    stats.drain_elapsed_us += start.elapsed().as_micros() as u64;
}

fn apply_skeleton_whitelist(identity: &mut IdentityPayload, shared: &SlaveShared) {
    if shared.skeleton_whitelist.is_empty() || identity.skeleton_url.is_empty() {
        return;
    }
    let allowed = shared
        .skeleton_whitelist
        .iter()
        .any(|prefix| identity.skeleton_url.starts_with(prefix.as_str()));
    if !allowed {
        debug!(
            url = %identity.skeleton_url,
            "skeleton not in whitelist - substituting replacement avatar"
        );
        identity.skeleton_url = shared.skeleton_replacement.clone();
    }
}

/// Parameters for one broadcast phase.
#[derive(Clone)]
pub struct BroadcastParams {
    pub now: Timestamp,
    pub budget_bytes: usize,
    pub throttling_ratio: f32,
    pub candidates: Arc<Vec<CandidateSnapshot>>,
}

/// Pass 2: compose and send a personalized digest to each recipient in the
/// chunk.
pub fn broadcast_chunk(
    nodes: &[Arc<MixerNode>],
    params: &BroadcastParams,
    shared: &SlaveShared,
    stats: &mut SlaveStats,
) {
    let start = Instant::now();
    let weights = shared.weights.load();

    for node in nodes {
        if !node.is_agent() || node.is_upstream() || node.active_socket().is_none() {
            continue;
        }
        let Some(client) = node.client() else {
            continue;
        };
        let mut state = client.lock();

        let mut full = Vec::new();
        let mut identity_only = Vec::new();
        for candidate in params.candidates.iter() {
            match classify(node, &state, candidate) {
                InterestClass::Full => full.push(candidate.clone()),
                InterestClass::IdentityOnly => identity_only.push(candidate.clone()),
                InterestClass::Drop => {}
            }
        }

        let recipient_position = if state.avatar.has_data() {
            state.avatar.world_position()
        } else {
            Vec3::ZERO
        };
        let view = state.view;

        let scored: Vec<_> = full
            .into_iter()
            .map(|candidate| {
                let score = priority_score(
                    recipient_position,
                    view.as_ref(),
                    &candidate,
                    params.now,
                    weights,
                );
                (score, candidate)
            })
            .collect();
        let ranked = sort_and_throttle(scored, params.throttling_ratio);

        let had_candidates = !ranked.is_empty() || !identity_only.is_empty();
        let result = encode_digest(
            &mut state,
            &ranked,
            &identity_only,
            shared.mixer_id,
            params.budget_bytes,
            params.now,
        );

        if had_candidates {
            stats.nodes_broadcast += 1;
        }
        stats.others_included += result.included as u64;
        stats.over_budget += result.over_budget as u64;
        stats.data_bytes += result.data_bytes as u64;
        stats.traits_bytes += result.traits_bytes as u64;
        stats.identity_bytes += result.identity_bytes as u64;

        for packet in &result.packets {
            state.outbound_bytes += packet.bytes.len() as u64;
            shared
                .sink
                .send_to(packet, node, packet.kind.is_reliable());
        }
    }

    stats.broadcast_elapsed_us += start.elapsed().as_micros() as u64;
}
