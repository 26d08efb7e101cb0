//! Per-node client record
//!
//! Everything the mixer tracks about one node: the current avatar payload,
//! identity state, trait streams, interest toggles, the inbound packet
//! queue, and the per-peer bookkeeping tables. All mutable state lives
//! behind one mutex; per-peer tables are keyed by peer local id only, so a
//! departed peer can be forgotten with three map removals.

use std::collections::{HashMap, VecDeque};

use glam::Vec3;
use parking_lot::{Mutex, MutexGuard};
use serde_json::json;

use aura_avatars::{AvatarBlob, IdentityState, TraitMap, TraitVersions};
use aura_core::{LocalId, NodeId, Timestamp, MAX_INBOX_DEPTH};

/// Recipient view installed by AvatarQuery; feeds the centeredness term of
/// the priority score.
#[derive(Clone, Copy, Debug)]
pub struct ViewFrustum {
    pub origin: Vec3,
    pub direction: Vec3,
}

/// A data-bearing packet parked for the next tick's drain pass.
#[derive(Clone, Debug)]
pub enum QueuedMessage {
    AvatarData(Vec<u8>),
    Identity(Vec<u8>),
    Traits(Vec<u8>),
    TraitsAck(u64),
}

impl QueuedMessage {
    /// Lossy payloads may be dropped on inbox overflow; identity and trait
    /// updates must survive.
    fn is_lossy(&self) -> bool {
        matches!(self, QueuedMessage::AvatarData(_))
    }
}

/// The mutable portion of a client record.
#[derive(Default)]
pub struct ClientState {
    pub avatar: AvatarBlob,
    pub identity: IdentityState,
    pub traits: TraitMap,

    /// Scrubbed name currently held in the display-name registry.
    pub base_display_name: String,
    /// Set when incoming identity changed the display name; cleared by the
    /// sweep once a session name is assigned.
    pub display_name_must_change: bool,

    pub requests_pal: bool,
    pub radius_ignore_enabled: bool,
    pub view: Option<ViewFrustum>,

    // per-peer tables, keyed by peer local id
    last_broadcast_time: HashMap<LocalId, Timestamp>,
    sent_identity_version: HashMap<LocalId, u64>,
    sent_trait_versions: HashMap<LocalId, TraitVersions>,

    /// Highest outgoing bulk-traits sequence this peer has acknowledged.
    pub acked_traits_seq: u64,
    /// Next outgoing bulk-traits sequence for this recipient.
    pub next_traits_seq: u64,

    inbox: VecDeque<QueuedMessage>,
    inbox_dropped: u64,

    // byte counters since the last stats snapshot
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
}

impl ClientState {
    /// Park a data-bearing packet for pass 1. On overflow the oldest lossy
    /// packet goes first; identity and traits are only dropped if the whole
    /// inbox is non-lossy.
    pub fn queue_packet(&mut self, message: QueuedMessage) {
        if self.inbox.len() >= MAX_INBOX_DEPTH {
            let victim = self
                .inbox
                .iter()
                .position(|m| m.is_lossy())
                .unwrap_or(0);
            self.inbox.remove(victim);
            self.inbox_dropped += 1;
        }
        self.inbox.push_back(message);
    }

    pub fn drain_inbox(&mut self) -> VecDeque<QueuedMessage> {
        std::mem::take(&mut self.inbox)
    }

    pub fn inbox_len(&self) -> usize {
        self.inbox.len()
    }

    pub fn inbox_dropped(&self) -> u64 {
        self.inbox_dropped
    }

    // -- per-peer tables ----------------------------------------------------

    pub fn last_broadcast_time(&self, peer: LocalId) -> Timestamp {
        self.last_broadcast_time
            .get(&peer)
            .copied()
            .unwrap_or(Timestamp::NEVER)
    }

    pub fn set_last_broadcast_time(&mut self, peer: LocalId, when: Timestamp) {
        self.last_broadcast_time.insert(peer, when);
    }

    pub fn sent_identity_version(&self, peer: LocalId) -> u64 {
        self.sent_identity_version.get(&peer).copied().unwrap_or(0)
    }

    pub fn set_sent_identity_version(&mut self, peer: LocalId, version: u64) {
        self.sent_identity_version.insert(peer, version);
    }

    pub fn sent_traits_mut(&mut self, peer: LocalId) -> &mut TraitVersions {
        self.sent_trait_versions.entry(peer).or_default()
    }

    /// Zero the sync state for `peer`, forcing identity and trait resend on
    /// the next matching tick. Used on ignore toggles and PAL open.
    pub fn reset_peer_sync(&mut self, peer: LocalId) {
        self.last_broadcast_time.insert(peer, Timestamp::NEVER);
        self.sent_identity_version.insert(peer, 0);
        self.sent_trait_versions.entry(peer).or_default().reset();
    }

    /// Forget a departed peer entirely.
    pub fn forget_peer(&mut self, peer: LocalId) {
        self.last_broadcast_time.remove(&peer);
        self.sent_identity_version.remove(&peer);
        self.sent_trait_versions.remove(&peer);
    }

    pub fn knows_peer(&self, peer: LocalId) -> bool {
        self.last_broadcast_time.contains_key(&peer)
            || self.sent_identity_version.contains_key(&peer)
            || self.sent_trait_versions.contains_key(&peer)
    }

    pub fn tracked_peers(&self) -> usize {
        self.last_broadcast_time.len()
    }

    /// Per-node stats blob for the telemetry record.
    pub fn json_stats(&self) -> serde_json::Value {
        json!({
            "display_name": self.identity.display_name(),
            "session_display_name": self.identity.session_display_name(),
            "identity_sequence": self.identity.sequence(),
            "inbox_depth": self.inbox.len(),
            "inbox_dropped": self.inbox_dropped,
            "tracked_peers": self.tracked_peers(),
            "requests_pal": self.requests_pal,
            "radius_ignore": self.radius_ignore_enabled,
        })
    }
}

/// Per-node record attached to a registry node.
pub struct ClientData {
    node_id: NodeId,
    local_id: LocalId,
    state: Mutex<ClientState>,
}

impl ClientData {
    pub fn new(node_id: NodeId, local_id: LocalId) -> Self {
        ClientData {
            node_id,
            local_id,
            state: Mutex::new(ClientState::default()),
        }
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[inline]
    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    pub fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock()
    }

    /// Non-blocking lock for the stats reporter; a contended node is
    /// skipped for that cycle.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ClientState>> {
        self.state.try_lock()
    }
}
