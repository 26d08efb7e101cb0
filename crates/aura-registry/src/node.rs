//! Node records
//!
//! A node is shared by the registry and whatever worker is currently
//! scanning it; everything mutable on it is behind its own lock or an
//! atomic. The attached payload `P` is the mixer's per-node record; the
//! registry never looks inside it.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use aura_core::{LocalId, NodeId, Timestamp};

/// What a node is to the mixer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// A connected client with a human avatar.
    Agent,
    /// A peer mixer we receive replicated traffic from.
    UpstreamMixer,
    /// A peer mixer we mirror replicated traffic to.
    DownstreamMixer,
    /// Server-side script host; receives digests like an agent does not.
    EntityScriptServer,
}

/// One registry entry.
pub struct Node<P> {
    id: NodeId,
    local_id: LocalId,
    kind: NodeKind,
    /// Set for shadow nodes materialized from upstream replication.
    /// Immutable after creation.
    replicated: bool,
    /// Set for nodes reached through an upstream mixer; such nodes never
    /// receive digests or identity pushes directly.
    upstream: bool,
    socket: RwLock<Option<SocketAddr>>,
    can_kick: AtomicBool,
    last_heard: AtomicU64,
    ignored: RwLock<HashSet<NodeId>>,
    client: RwLock<Option<Arc<P>>>,
}

impl<P> Node<P> {
    pub(crate) fn new(
        id: NodeId,
        local_id: LocalId,
        kind: NodeKind,
        socket: Option<SocketAddr>,
        upstream: bool,
        replicated: bool,
    ) -> Self {
        Node {
            id,
            local_id,
            kind,
            replicated,
            upstream,
            socket: RwLock::new(socket),
            can_kick: AtomicBool::new(false),
            last_heard: AtomicU64::new(0),
            ignored: RwLock::new(HashSet::new()),
            client: RwLock::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[inline]
    pub fn is_agent(&self) -> bool {
        self.kind == NodeKind::Agent
    }

    #[inline]
    pub fn is_upstream(&self) -> bool {
        self.upstream
    }

    #[inline]
    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    /// Socket the transport can currently reach this node at.
    pub fn active_socket(&self) -> Option<SocketAddr> {
        *self.socket.read()
    }

    pub fn set_socket(&self, addr: SocketAddr) {
        *self.socket.write() = Some(addr);
    }

    pub fn can_kick(&self) -> bool {
        self.can_kick.load(Ordering::Relaxed)
    }

    pub fn set_can_kick(&self, allowed: bool) {
        self.can_kick.store(allowed, Ordering::Relaxed);
    }

    /// Record traffic from this node.
    pub fn touch(&self, now: Timestamp) {
        self.last_heard.store(now.as_micros(), Ordering::Relaxed);
    }

    pub fn last_heard(&self) -> Timestamp {
        Timestamp::from_micros(self.last_heard.load(Ordering::Relaxed))
    }

    // -- ignore set ---------------------------------------------------------

    pub fn add_ignored(&self, id: NodeId) {
        self.ignored.write().insert(id);
    }

    pub fn remove_ignored(&self, id: NodeId) {
        self.ignored.write().remove(&id);
    }

    pub fn is_ignoring(&self, id: NodeId) -> bool {
        self.ignored.read().contains(&id)
    }

    // -- attached payload ---------------------------------------------------

    /// The attached per-node payload, if one has been created.
    pub fn client(&self) -> Option<Arc<P>> {
        self.client.read().clone()
    }

    /// Get the attached payload, creating it on first access.
    pub fn client_or_init(&self, init: impl FnOnce() -> P) -> Arc<P> {
        if let Some(existing) = self.client.read().clone() {
            return existing;
        }
        let mut slot = self.client.write();
        if let Some(existing) = slot.clone() {
            return existing;
        }
        let created = Arc::new(init());
        *slot = Some(created.clone());
        created
    }

    /// Detach the payload (node is being torn down).
    pub fn take_client(&self) -> Option<Arc<P>> {
        self.client.write().take()
    }
}

impl<P> std::fmt::Debug for Node<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("local_id", &self.local_id)
            .field("kind", &self.kind)
            .field("replicated", &self.replicated)
            .field("upstream", &self.upstream)
            .finish()
    }
}
