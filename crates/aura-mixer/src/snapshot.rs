//! Per-tick candidate snapshots
//!
//! Pass 2 never takes two client mutexes at once: before the broadcast
//! phase the loop thread walks the registry once and snapshots everything
//! the encoder needs about each candidate. Workers then only lock their own
//! recipient's record. Payload bytes are shared through `Arc`, so a tick
//! costs one copy per candidate, not one per (recipient, candidate) pair.

use std::sync::Arc;

use glam::Vec3;

use aura_avatars::TraitMap;
use aura_core::{Clock, LocalId, NodeId, Timestamp};

use crate::MixerNode;

/// Everything pass 2 needs to know about one broadcast candidate.
#[derive(Clone)]
pub struct CandidateSnapshot {
    /// Live handle, used for the candidate-side ignore check.
    pub node: Arc<MixerNode>,
    pub node_id: NodeId,
    pub local_id: LocalId,
    pub position: Vec3,
    pub bounding_radius: f32,
    pub last_updated: Timestamp,
    pub identity_sequence: u64,
    /// Identity wire bytes with the subject id stamped in.
    pub identity_bytes: Arc<Vec<u8>>,
    /// Whole avatar payload, forwarded byte-for-byte.
    pub data: Arc<Vec<u8>>,
    pub traits: Arc<TraitMap>,
}

/// Snapshot every agent that has sent avatar data.
///
/// Runs on the loop thread between the identity sweep and pass 2, under the
/// registry read lock held by the caller.
pub fn build_candidate_snapshots(nodes: &[Arc<MixerNode>], _clock: &Clock) -> Vec<CandidateSnapshot> {
    let mut snapshots = Vec::with_capacity(nodes.len());

    for node in nodes {
        if !node.is_agent() {
            continue;
        }
        let Some(client) = node.client() else {
            continue;
        };
        let state = client.lock();
        if !state.avatar.has_data() {
            continue;
        }

        snapshots.push(CandidateSnapshot {
            node: node.clone(),
            node_id: node.id(),
            local_id: node.local_id(),
            position: state.avatar.world_position(),
            bounding_radius: state.avatar.bounding_radius(),
            last_updated: state.avatar.last_updated(),
            identity_sequence: state.identity.sequence(),
            identity_bytes: Arc::new(state.identity.encode_for(node.id())),
            data: Arc::new(state.avatar.bytes().to_vec()),
            traits: Arc::new(state.traits.clone()),
        });
    }

    snapshots
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_avatars::encode_payload;
    use aura_core::Clock;
    use aura_registry::{NodeFlags, NodeKind};
    use crate::{ClientData, Registry};

    #[test]
    fn test_snapshot_skips_nodes_without_data() {
        let clock = Clock::new();
        let registry = Registry::new(clock);
        let with_data = registry
            .add_or_update(NodeId::random(), NodeKind::Agent, None, NodeFlags::default())
            .unwrap();
        let without_data = registry
            .add_or_update(NodeId::random(), NodeKind::Agent, None, NodeFlags::default())
            .unwrap();
        let mixer_peer = registry
            .add_or_update(
                NodeId::random(),
                NodeKind::DownstreamMixer,
                None,
                NodeFlags::default(),
            )
            .unwrap();

        for node in [&with_data, &without_data, &mixer_peer] {
            node.client_or_init(|| ClientData::new(node.id(), node.local_id()));
        }
        {
            let client = with_data.client().unwrap();
            let payload = encode_payload(Vec3::new(1.0, 0.0, 0.0), 0.4, b"rest");
            client.lock().avatar.apply(&payload, clock.now()).unwrap();
        }

        let snapshots =
            registry.nested_each(|nodes| build_candidate_snapshots(nodes, &clock));
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].node_id, with_data.id());
        assert_eq!(snapshots[0].position, Vec3::new(1.0, 0.0, 0.0));
    }
}
