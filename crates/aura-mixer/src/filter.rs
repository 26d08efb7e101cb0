//! Interest filter
//!
//! Classifies each (recipient, candidate) pair before encoding. Ignores are
//! mutual kills for data; a recipient with the PAL open still receives
//! identity for peers it ignores, so those entries can populate the list.

use glam::Vec3;

use crate::{CandidateSnapshot, ClientState, MixerNode};

/// Ignore-bubble scale applied to the recipient's bounding radius.
const RADIUS_IGNORE_SCALE: f32 = 2.0;

/// Floor for the ignore bubble, so tiny avatars still get one.
const MIN_IGNORE_RADIUS: f32 = 1.0;

/// What a recipient may receive about a candidate this tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterestClass {
    /// Data, identity, and traits.
    Full,
    /// Identity only - the recipient ignores the candidate but has the
    /// PAL open.
    IdentityOnly,
    /// Nothing.
    Drop,
}

/// Classify one candidate for one recipient.
///
/// The caller holds the recipient's client lock; the candidate side is read
/// from the per-tick snapshot and the candidate's ignore set.
pub fn classify(
    recipient: &MixerNode,
    recipient_state: &ClientState,
    candidate: &CandidateSnapshot,
) -> InterestClass {
    if candidate.node_id == recipient.id() {
        return InterestClass::Drop;
    }

    let ignored = recipient.is_ignoring(candidate.node_id)
        || candidate.node.is_ignoring(recipient.id())
        || radius_ignored(recipient_state, candidate);

    if !ignored {
        return InterestClass::Full;
    }

    if recipient_state.requests_pal {
        InterestClass::IdentityOnly
    } else {
        InterestClass::Drop
    }
}

fn radius_ignored(recipient_state: &ClientState, candidate: &CandidateSnapshot) -> bool {
    if !recipient_state.radius_ignore_enabled || !recipient_state.avatar.has_data() {
        return false;
    }
    let bubble = (recipient_state.avatar.bounding_radius() * RADIUS_IGNORE_SCALE)
        .max(MIN_IGNORE_RADIUS)
        + candidate.bounding_radius;
    distance(recipient_state.avatar.world_position(), candidate.position) <= bubble
}

fn distance(a: Vec3, b: Vec3) -> f32 {
    (a - b).length()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use aura_avatars::{encode_payload, TraitMap};
    use aura_core::{Clock, NodeId, Timestamp};
    use aura_registry::{NodeFlags, NodeKind};

    use crate::{ClientData, Registry};

    struct Fixture {
        registry: Registry,
        clock: Clock,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Clock::new();
            Fixture {
                registry: Registry::new(clock),
                clock,
            }
        }

        fn agent(&self, position: Vec3) -> Arc<MixerNode> {
            let node = self
                .registry
                .add_or_update(NodeId::random(), NodeKind::Agent, None, NodeFlags::default())
                .unwrap();
            let client = node.client_or_init(|| ClientData::new(node.id(), node.local_id()));
            let payload = encode_payload(position, 0.5, &[]);
            client
                .lock()
                .avatar
                .apply(&payload, self.clock.now())
                .unwrap();
            node
        }

        fn snapshot(&self, node: &Arc<MixerNode>) -> CandidateSnapshot {
            let client = node.client().unwrap();
            let state = client.lock();
            CandidateSnapshot {
                node: node.clone(),
                node_id: node.id(),
                local_id: node.local_id(),
                position: state.avatar.world_position(),
                bounding_radius: state.avatar.bounding_radius(),
                last_updated: Timestamp::from_micros(1),
                identity_sequence: state.identity.sequence(),
                identity_bytes: Arc::new(Vec::new()),
                data: Arc::new(state.avatar.bytes().to_vec()),
                traits: Arc::new(TraitMap::new()),
            }
        }
    }

    #[test]
    fn test_strangers_get_full_interest() {
        let fixture = Fixture::new();
        let recipient = fixture.agent(Vec3::ZERO);
        let candidate = fixture.agent(Vec3::new(10.0, 0.0, 0.0));
        let snap = fixture.snapshot(&candidate);

        let client = recipient.client().unwrap();
        let state = client.lock();
        assert_eq!(classify(&recipient, &state, &snap), InterestClass::Full);
    }

    #[test]
    fn test_self_is_dropped() {
        let fixture = Fixture::new();
        let recipient = fixture.agent(Vec3::ZERO);
        let snap = fixture.snapshot(&recipient);

        let client = recipient.client().unwrap();
        let state = client.lock();
        assert_eq!(classify(&recipient, &state, &snap), InterestClass::Drop);
    }

    #[test]
    fn test_ignore_is_mutual() {
        let fixture = Fixture::new();
        let recipient = fixture.agent(Vec3::ZERO);
        let candidate = fixture.agent(Vec3::new(10.0, 0.0, 0.0));
        let snap = fixture.snapshot(&candidate);

        // recipient ignores candidate
        recipient.add_ignored(candidate.id());
        {
            let client = recipient.client().unwrap();
            let state = client.lock();
            assert_eq!(classify(&recipient, &state, &snap), InterestClass::Drop);
        }
        recipient.remove_ignored(candidate.id());

        // candidate ignores recipient - same outcome
        candidate.add_ignored(recipient.id());
        let client = recipient.client().unwrap();
        let state = client.lock();
        assert_eq!(classify(&recipient, &state, &snap), InterestClass::Drop);
    }

    #[test]
    fn test_pal_upgrades_ignored_to_identity_only() {
        let fixture = Fixture::new();
        let recipient = fixture.agent(Vec3::ZERO);
        let candidate = fixture.agent(Vec3::new(10.0, 0.0, 0.0));
        let snap = fixture.snapshot(&candidate);

        recipient.add_ignored(candidate.id());
        let client = recipient.client().unwrap();
        let mut state = client.lock();
        state.requests_pal = true;
        assert_eq!(
            classify(&recipient, &state, &snap),
            InterestClass::IdentityOnly
        );
    }

    #[test]
    fn test_radius_ignore_drops_nearby_only() {
        let fixture = Fixture::new();
        let recipient = fixture.agent(Vec3::ZERO);
        let near = fixture.agent(Vec3::new(0.5, 0.0, 0.0));
        let far = fixture.agent(Vec3::new(30.0, 0.0, 0.0));
        let near_snap = fixture.snapshot(&near);
        let far_snap = fixture.snapshot(&far);

        let client = recipient.client().unwrap();
        let mut state = client.lock();
        state.radius_ignore_enabled = true;

        assert_eq!(classify(&recipient, &state, &near_snap), InterestClass::Drop);
        assert_eq!(classify(&recipient, &state, &far_snap), InterestClass::Full);
    }
}
