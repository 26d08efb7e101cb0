//! Replication policy
//!
//! Which downstream mixers a given source's traffic should be mirrored to
//! is a per-deployment decision; the default mirrors every agent to every
//! downstream mixer.

use aura_registry::NodeKind;

use crate::MixerNode;

/// Per-deployment replication policy hook.
pub trait ReplicationPolicy: Send + Sync {
    fn should_replicate_to(&self, source: &MixerNode, downstream: &MixerNode) -> bool;
}

/// Mirror every agent to every downstream mixer.
pub struct DefaultReplicationPolicy;

impl ReplicationPolicy for DefaultReplicationPolicy {
    fn should_replicate_to(&self, source: &MixerNode, downstream: &MixerNode) -> bool {
        source.is_agent() && downstream.kind() == NodeKind::DownstreamMixer
    }
}
