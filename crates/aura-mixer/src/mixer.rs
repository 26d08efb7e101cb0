//! The avatar mixer
//!
//! Owns the registry, the slave pool, the throttle, the display-name
//! registry, and the transport sinks. The receive thread funnels datagrams
//! into `handle_datagram`; the loop thread runs `run`, which drives the
//! per-tick phases at the broadcast rate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use aura_core::{AuraError, Clock, NodeId, Timestamp, BROADCAST_RATE_HZ, NODE_ID_WIRE_SIZE};
use aura_registry::{NodeFlags, NodeKind};
use aura_wire::{
    KillReason, ListPacketWriter, Message, PacketKind, PacketWriter, WirePacket,
};

use crate::{
    build_candidate_snapshots, build_stats_record, BroadcastParams, CandidateSnapshot, Censor,
    ClientData, DisplayNameRegistry, FrameTimer, LoopCounters, MixerNode, MixerSettings,
    PacketSink, QueuedMessage, Registry, ReplicationPolicy, SlaveJob, SlavePool, SlaveShared,
    SortWeights, StatsSink, ThrottleController, SILENT_NODE_TIMEOUT,
};

/// Minimum spacing between repeated per-sender log or echo events.
const SENDER_EVENT_INTERVAL: Duration = Duration::from_secs(60);

struct SenderRateLimiter {
    entries: Mutex<HashMap<SocketAddr, Timestamp>>,
}

impl SenderRateLimiter {
    fn new() -> Self {
        SenderRateLimiter {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn allow(&self, sender: SocketAddr, now: Timestamp) -> bool {
        let mut entries = self.entries.lock();
        let allowed = entries
            .get(&sender)
            .map(|last| (now - *last) >= SENDER_EVENT_INTERVAL)
            .unwrap_or(true);
        if allowed {
            entries.insert(sender, now);
        }
        allowed
    }
}

/// The mixer instance.
pub struct AvatarMixer {
    registry: Arc<Registry>,
    sink: Arc<dyn PacketSink>,
    stats_sink: Arc<dyn StatsSink>,
    policy: Arc<dyn ReplicationPolicy>,
    names: DisplayNameRegistry,
    censor: Censor,
    weights: Arc<SortWeights>,
    throttle: ThrottleController,
    pool: SlavePool,
    clock: Clock,
    mixer_id: NodeId,
    budget_bytes: usize,
    running: AtomicBool,
    counters: LoopCounters,
    echo_limiter: SenderRateLimiter,
    warn_limiter: SenderRateLimiter,
}

impl AvatarMixer {
    pub fn new(
        settings: MixerSettings,
        registry: Arc<Registry>,
        sink: Arc<dyn PacketSink>,
        stats_sink: Arc<dyn StatsSink>,
        policy: Arc<dyn ReplicationPolicy>,
    ) -> Self {
        let clock = registry.clock();
        let mixer_id = NodeId::random();
        let weights = Arc::new(SortWeights::new());

        let shared = Arc::new(SlaveShared {
            registry: registry.clone(),
            sink: sink.clone(),
            weights: weights.clone(),
            clock,
            mixer_id,
            skeleton_whitelist: settings.skeleton_whitelist.clone(),
            skeleton_replacement: settings.skeleton_replacement.clone(),
            min_bounding_radius: settings.min_avatar_height / 2.0,
            max_bounding_radius: settings.max_avatar_height / 2.0,
        });

        let threads = settings.worker_threads();
        let pool = SlavePool::new(shared, threads);
        let budget_bytes = settings.budget_bytes_per_tick(BROADCAST_RATE_HZ);

        info!(
            %mixer_id,
            threads,
            budget_bytes,
            "avatar mixer ready"
        );

        AvatarMixer {
            registry,
            sink,
            stats_sink,
            policy,
            names: DisplayNameRegistry::new(),
            censor: Censor::default(),
            weights,
            throttle: ThrottleController::new(),
            pool,
            clock,
            mixer_id,
            budget_bytes,
            running: AtomicBool::new(true),
            counters: LoopCounters::default(),
            echo_limiter: SenderRateLimiter::new(),
            warn_limiter: SenderRateLimiter::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn names(&self) -> &DisplayNameRegistry {
        &self.names
    }

    pub fn throttling_ratio(&self) -> f32 {
        self.throttle.ratio()
    }

    pub fn mixer_id(&self) -> NodeId {
        self.mixer_id
    }

    /// Swap the censor table (deployment hook).
    pub fn set_censor(&mut self, censor: Censor) {
        self.censor = censor;
    }

    // -- receive thread -----------------------------------------------------

    /// Entry point for every datagram from the transport.
    pub fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let start = Instant::now();
        match Message::parse(bytes) {
            Ok(inbound) => self.dispatch(inbound.sender, inbound.message, from),
            Err(AuraError::VersionMismatch { kind, .. }) => {
                self.echo_version_mismatch(kind, bytes, from);
            }
            Err(error) => {
                let now = self.clock.now();
                if self.warn_limiter.allow(from, now) {
                    warn!(%from, %error, "dropping malformed packet");
                }
            }
        }
        self.counters.add(
            &self.counters.process_events_us,
            start.elapsed().as_micros() as u64,
        );
    }

    fn dispatch(&self, sender: Option<NodeId>, message: Message, from: SocketAddr) {
        // sourced packets admit their sender as an agent on first contact
        let sender_node = sender.and_then(|id| {
            self.registry
                .add_or_update(id, NodeKind::Agent, Some(from), NodeFlags::default())
                .ok()
        });

        match message {
            Message::AvatarData { payload } => {
                if let Some(node) = sender_node {
                    self.queue_incoming(&node, QueuedMessage::AvatarData(payload));
                }
            }
            Message::AvatarIdentity { payload } => {
                if let Some(node) = sender_node {
                    self.replicate_to_downstream(
                        &node,
                        PacketKind::ReplicatedAvatarIdentity,
                        |writer| {
                            writer.write_node_id(node.id());
                            writer.write_bytes(&payload);
                        },
                    );
                    self.queue_incoming(&node, QueuedMessage::Identity(payload));
                }
            }
            Message::SetAvatarTraits { payload } => {
                if let Some(node) = sender_node {
                    self.queue_incoming(&node, QueuedMessage::Traits(payload));
                }
            }
            Message::BulkAvatarTraitsAck { seq } => {
                if let Some(node) = sender_node {
                    self.queue_incoming(&node, QueuedMessage::TraitsAck(seq));
                }
            }
            Message::AvatarIdentityRequest { avatar } => {
                if let Some(node) = sender_node {
                    self.handle_identity_request(&node, avatar);
                }
            }
            Message::KillAvatar { avatar, .. } => {
                if let Some(node) = sender_node {
                    self.handle_kill_packet(&node, avatar);
                }
            }
            Message::NodeIgnoreRequest { add, ids } => {
                if let Some(node) = sender_node {
                    self.handle_ignore_request(&node, add, &ids);
                }
            }
            Message::RadiusIgnoreRequest { enabled } => {
                if let Some(node) = sender_node {
                    let client = self.client_for(&node);
                    client.lock().radius_ignore_enabled = enabled;
                }
            }
            Message::RequestsDomainListData { requesting } => {
                if let Some(node) = sender_node {
                    self.handle_requests_pal(&node, requesting);
                }
            }
            Message::AvatarQuery { origin, direction } => {
                if let Some(node) = sender_node {
                    let client = self.client_for(&node);
                    client.lock().view = Some(crate::ViewFrustum {
                        origin: origin.into(),
                        direction: glam::Vec3::from(direction).normalize_or_zero(),
                    });
                }
            }
            Message::AdjustAvatarSorting { size, center, age } => {
                if let Some(node) = sender_node {
                    if node.can_kick() {
                        self.weights.store(size, center, age);
                        debug!(size, center, age, "new avatar sort weights");
                    }
                    // unprivileged adjustments drop silently
                }
            }
            Message::ReplicatedAvatarIdentity { avatar, payload } => {
                self.handle_replicated_identity(avatar, payload, from);
            }
            Message::ReplicatedKillAvatar { avatar, .. } => {
                self.handle_replicated_kill(avatar);
            }
            Message::ReplicatedBulkAvatarData { segments } => {
                self.handle_replicated_bulk(segments, from);
            }
        }
    }

    fn client_for(&self, node: &Arc<MixerNode>) -> Arc<ClientData> {
        node.client_or_init(|| ClientData::new(node.id(), node.local_id()))
    }

    fn queue_incoming(&self, node: &Arc<MixerNode>, message: QueuedMessage) {
        let client = self.client_for(node);
        let mut state = client.lock();
        let len = match &message {
            QueuedMessage::AvatarData(p)
            | QueuedMessage::Identity(p)
            | QueuedMessage::Traits(p) => p.len(),
            QueuedMessage::TraitsAck(_) => 8,
        };
        state.inbound_bytes += len as u64;
        state.queue_packet(message);
    }

    // -- control-plane handlers ---------------------------------------------

    fn handle_ignore_request(&self, sender: &Arc<MixerNode>, add: bool, ids: &[NodeId]) {
        let sender_client = self.client_for(sender);

        for &ignored_id in ids {
            let ignored_node = self.registry.node_with_id(ignored_id);

            if let Some(ignored) = &ignored_node {
                // zero the sync state in both directions so identity flows
                // again after an unignore
                sender_client.lock().reset_peer_sync(ignored.local_id());
                if let Some(ignored_client) = ignored.client() {
                    ignored_client.lock().reset_peer_sync(sender.local_id());
                }
            }

            if add {
                sender.add_ignored(ignored_id);

                // tell the ignored client to forget the sender's avatar
                if let Some(ignored) = &ignored_node {
                    if ignored.is_agent() && ignored.active_socket().is_some() {
                        let mut writer = PacketWriter::new(PacketKind::KillAvatar, self.mixer_id);
                        writer.write_node_id(sender.id());
                        writer.write_u8(KillReason::Ignored.to_byte());
                        self.sink.send_to(&writer.finish(), ignored, true);
                    }
                }
            } else {
                sender.remove_ignored(ignored_id);
            }
        }
    }

    fn handle_requests_pal(&self, sender: &Arc<MixerNode>, requesting: bool) {
        let client = self.client_for(sender);
        let was_requesting = {
            let mut state = client.lock();
            let was = state.requests_pal;
            state.requests_pal = requesting;
            was
        };
        debug!(node = %sender.id(), requesting, "requests domain list data");

        // on PAL open, unsync every currently-ignored peer so their
        // identity repopulates the list
        if requesting && !was_requesting {
            self.registry.each_matching(
                |other| other.id() != sender.id() && sender.is_ignoring(other.id()),
                |other| {
                    client.lock().reset_peer_sync(other.local_id());
                },
            );
        }
    }

    fn handle_identity_request(&self, sender: &Arc<MixerNode>, avatar: NodeId) {
        let Some(requested) = self.registry.node_with_id(avatar) else {
            return;
        };
        let Some(requested_client) = requested.client() else {
            return;
        };

        let bytes = requested_client.lock().identity.encode_for(requested.id());
        self.send_identity_list(bytes, sender);

        // force trait resync toward the requester
        let sender_client = self.client_for(sender);
        sender_client
            .lock()
            .sent_traits_mut(requested.local_id())
            .reset();
    }

    fn handle_kill_packet(&self, sender: &Arc<MixerNode>, target: NodeId) {
        let victim = if target.is_nil() || target == sender.id() {
            Some(sender.clone())
        } else if sender.can_kick() {
            self.registry.node_with_id(target)
        } else {
            // unprivileged kill of someone else drops silently
            None
        };

        if let Some(victim) = victim {
            self.kill_node(&victim);
        }
    }

    // -- replication --------------------------------------------------------

    fn handle_replicated_identity(&self, avatar: NodeId, payload: Vec<u8>, from: SocketAddr) {
        let Ok(shadow) = self.shadow_node(avatar, from) else {
            return;
        };
        self.replicate_to_downstream(&shadow, PacketKind::ReplicatedAvatarIdentity, |writer| {
            writer.write_node_id(avatar);
            writer.write_bytes(&payload);
        });
        self.queue_incoming(&shadow, QueuedMessage::Identity(payload));
    }

    fn handle_replicated_kill(&self, avatar: NodeId) {
        // only meaningful if we already know the avatar; adding a node just
        // to remove it an instant later would be pointless
        let Some(node) = self.registry.node_with_id(avatar) else {
            return;
        };
        self.kill_node(&node);
    }

    fn handle_replicated_bulk(&self, segments: Vec<(NodeId, Vec<u8>)>, from: SocketAddr) {
        for (avatar, payload) in segments {
            let Ok(shadow) = self.shadow_node(avatar, from) else {
                continue;
            };
            self.replicate_to_downstream(&shadow, PacketKind::ReplicatedBulkAvatarData, |writer| {
                writer.write_node_id(avatar);
                writer.write_prefixed_bytes(&payload);
            });
            self.queue_incoming(&shadow, QueuedMessage::AvatarData(payload));
        }
    }

    /// Materialize or refresh the shadow node for an upstream-replicated
    /// avatar.
    fn shadow_node(
        &self,
        avatar: NodeId,
        from: SocketAddr,
    ) -> Result<Arc<MixerNode>, AuraError> {
        self.registry.add_or_update(
            avatar,
            NodeKind::Agent,
            Some(from),
            NodeFlags {
                upstream: true,
                replicated: true,
            },
        )
    }

    /// Mirror one packet to every downstream mixer the policy selects for
    /// `source`.
    fn replicate_to_downstream(
        &self,
        source: &Arc<MixerNode>,
        kind: PacketKind,
        build: impl Fn(&mut PacketWriter),
    ) {
        if kind.direct_counterpart().is_none() {
            return;
        }

        let mut packet: Option<WirePacket> = None;
        self.registry.each_matching(
            |other| {
                other.kind() == NodeKind::DownstreamMixer
                    && other.active_socket().is_some()
                    && self.policy.should_replicate_to(source, other)
            },
            |downstream| {
                let packet = packet.get_or_insert_with(|| {
                    let mut writer = PacketWriter::new(kind, self.mixer_id);
                    build(&mut writer);
                    writer.finish()
                });
                self.sink.send_to(packet, downstream, false);
            },
        );
    }

    /// Mirror this tick's local avatar data to downstream mixers as one
    /// bulk digest per mixer.
    fn replicate_bulk_digest(&self, candidates: &[CandidateSnapshot]) {
        self.registry.each_matching(
            |other| {
                other.kind() == NodeKind::DownstreamMixer && other.active_socket().is_some()
            },
            |downstream| {
                let mut list =
                    ListPacketWriter::new(PacketKind::ReplicatedBulkAvatarData, self.mixer_id);
                for candidate in candidates {
                    // replicated sources are forwarded on ingress, not here
                    if candidate.node.is_replicated() {
                        continue;
                    }
                    if !self.policy.should_replicate_to(&candidate.node, downstream) {
                        continue;
                    }
                    let mut item = Vec::with_capacity(18 + candidate.data.len());
                    item.extend_from_slice(&candidate.node_id.to_bytes());
                    item.extend_from_slice(&(candidate.data.len() as u16).to_le_bytes());
                    item.extend_from_slice(&candidate.data);
                    list.write_item(&item);
                }
                for packet in list.finish() {
                    self.sink.send_to(&packet, downstream, false);
                }
            },
        );
    }

    // -- kill fan-out -------------------------------------------------------

    /// Full departure handling for one node: registry removal, display-name
    /// release, kill fan-out, and per-peer cleanup on every survivor.
    pub fn kill_node(&self, node: &Arc<MixerNode>) {
        let node = self.registry.remove(node.id()).unwrap_or_else(|| node.clone());

        if !node.is_agent() {
            return;
        }
        let Some(client) = node.client() else {
            return;
        };

        {
            let state = client.lock();
            if !state.base_display_name.is_empty() {
                self.names.release(&state.base_display_name);
            }
        }

        let mut kill_packet: Option<WirePacket> = None;
        let mut replicated_kill: Option<WirePacket> = None;

        self.registry.each_matching(
            |other| {
                other.active_socket().is_some()
                    && ((other.is_agent() && !other.is_upstream())
                        || self.policy.should_replicate_to(&node, other))
            },
            |other| {
                if other.is_agent() {
                    let packet = kill_packet.get_or_insert_with(|| {
                        let mut writer = PacketWriter::new(PacketKind::KillAvatar, self.mixer_id);
                        writer.write_node_id(node.id());
                        writer.write_u8(KillReason::Disconnected.to_byte());
                        writer.finish()
                    });
                    self.sink.send_to(packet, other, true);
                } else {
                    let packet = replicated_kill.get_or_insert_with(|| {
                        let mut writer =
                            PacketWriter::new(PacketKind::ReplicatedKillAvatar, self.mixer_id);
                        writer.write_node_id(node.id());
                        writer.write_u8(KillReason::Disconnected.to_byte());
                        writer.finish()
                    });
                    self.sink.send_to(packet, other, false);
                }
            },
        );

        // every survivor forgets the departed peer, each under its own lock
        let departed_local = node.local_id();
        self.registry.each_matching(
            |other| other.id() != node.id() && other.client().is_some(),
            |other| {
                if let Some(other_client) = other.client() {
                    other_client.lock().forget_peer(departed_local);
                }
            },
        );

        node.take_client();
        debug!(node = %node.id(), "avatar killed");
    }

    // -- identity sweep -----------------------------------------------------

    /// Assign session display names to agents whose display name changed.
    /// Runs single-threaded between pass 1 and pass 2; iteration order is
    /// the registry's ascending-id order, so collisions resolve
    /// deterministically.
    fn manage_identity(&self, node: &Arc<MixerNode>) {
        let Some(client) = node.client() else {
            return;
        };

        let identity_bytes = {
            let mut state = client.lock();
            // nothing to manage before the first identity packet
            if !state.identity.received_first() || !state.display_name_must_change {
                return;
            }

            if !state.base_display_name.is_empty() {
                self.names.release(&state.base_display_name);
            }

            let base = crate::scrub_display_name(state.identity.display_name(), &self.censor);
            let session = self.names.assign(&base);
            debug!(node = %node.id(), %session, "giving session display name");

            state.base_display_name = base;
            state.identity.set_session_display_name(session);
            state.display_name_must_change = false;

            // the rename is an identity change, so it gets a new sequence;
            // the packet below goes out exactly once
            state.identity.push_sequence();
            state.identity.encode_for(node.id())
        };

        if !node.is_upstream() {
            self.send_identity_list(identity_bytes, node);
        }
    }

    /// Send one identity payload to one node as a reliable list packet.
    fn send_identity_list(&self, bytes: Vec<u8>, to: &Arc<MixerNode>) {
        if !to.is_agent() || to.is_upstream() {
            return;
        }
        let mut list = ListPacketWriter::new(PacketKind::AvatarIdentity, self.mixer_id);
        let mut item = Vec::with_capacity(2 + bytes.len());
        item.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        item.extend_from_slice(&bytes);
        list.write_item(&item);
        for packet in list.finish() {
            self.sink.send_to(&packet, to, true);
        }
        self.counters.add(&self.counters.identity_packets, 1);
    }

    // -- version mismatch ---------------------------------------------------

    /// Echo an empty AvatarData packet so the sender's client can raise its
    /// version-mismatch dialog. Rate limited per sender.
    fn echo_version_mismatch(&self, kind_tag: u8, bytes: &[u8], from: SocketAddr) {
        let kind = PacketKind::from_byte(kind_tag);
        if !matches!(
            kind,
            Some(PacketKind::AvatarData) | Some(PacketKind::AvatarIdentity)
        ) {
            return;
        }
        let now = self.clock.now();
        if !self.echo_limiter.allow(from, now) {
            return;
        }

        // the claimed sender uuid sits after the two header bytes
        if bytes.len() < 2 + NODE_ID_WIRE_SIZE {
            return;
        }
        let claimed = NodeId::from_bytes(bytes[2..2 + NODE_ID_WIRE_SIZE].try_into().unwrap());
        let Some(node) = self.registry.node_with_id(claimed) else {
            return;
        };

        let empty = PacketWriter::new(PacketKind::AvatarData, self.mixer_id).finish();
        self.sink.send_to(&empty, &node, false);
        debug!(%from, "echoed empty avatar data for version mismatch");
    }

    // -- the loop -----------------------------------------------------------

    /// One full tick: pass 1, identity sweep, candidate snapshot, pass 2,
    /// downstream bulk replication.
    pub fn run_tick(&self) {
        let now = self.clock.now();

        let start = Instant::now();
        self.registry
            .nested_each(|nodes| self.pool.run(SlaveJob::Drain, nodes));
        self.counters
            .add(&self.counters.drain_us, start.elapsed().as_micros() as u64);

        let start = Instant::now();
        self.registry.nested_each(|nodes| {
            for node in nodes {
                if node.is_agent() {
                    self.manage_identity(node);
                }
                self.counters.add(&self.counters.listeners, 1);
            }
        });
        self.counters.add(
            &self.counters.display_name_us,
            start.elapsed().as_micros() as u64,
        );

        let start = Instant::now();
        let candidates = Arc::new(
            self.registry
                .nested_each(|nodes| build_candidate_snapshots(nodes, &self.clock)),
        );
        self.counters.add(
            &self.counters.snapshot_us,
            start.elapsed().as_micros() as u64,
        );

        let start = Instant::now();
        let params = BroadcastParams {
            now,
            budget_bytes: self.budget_bytes,
            throttling_ratio: self.throttle.ratio(),
            candidates: candidates.clone(),
        };
        self.registry
            .nested_each(|nodes| self.pool.run(SlaveJob::Broadcast(params.clone()), nodes));
        self.counters.add(
            &self.counters.broadcast_us,
            start.elapsed().as_micros() as u64,
        );

        self.replicate_bulk_digest(&candidates);

        self.counters.add(&self.counters.frames, 1);
    }

    /// The tight loop. Returns when `stop` is called.
    pub fn run(&self) {
        let mut timer = FrameTimer::new(BROADCAST_RATE_HZ);
        let mut frame: u64 = 1;
        let mut last_stats = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            let duration = timer.time_frame();
            self.throttle.update(duration, frame);

            self.run_tick();

            let elapsed = last_stats.elapsed();
            if elapsed >= Duration::from_secs(1) {
                self.reap_silent_nodes();
                self.send_stats(elapsed);
                last_stats = Instant::now();
            }

            frame += 1;
        }
        info!("avatar mixer loop finished");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Departure detection for nodes the transport stopped hearing from.
    pub fn reap_silent_nodes(&self) {
        for node in self.registry.remove_silent(SILENT_NODE_TIMEOUT) {
            debug!(node = %node.id(), "node timed out");
            self.kill_node(&node);
        }
    }

    /// Snapshot and publish the stats record.
    pub fn send_stats(&self, elapsed: Duration) {
        let start = Instant::now();

        let snapshot = self.counters.drain();
        let slaves = self.pool.harvest_stats();
        let loop_rate = snapshot.frames as f64 / elapsed.as_secs_f64().max(0.001);
        let elapsed_secs = elapsed.as_secs_f64().max(0.001);

        let mut avatars = serde_json::Map::new();
        self.registry.each_matching(
            |_| true,
            |node| {
                let mut entry = json!({});
                if let Some(client) = node.client() {
                    // skip a contended node rather than stall the loop
                    if let Some(mut state) = client.try_lock() {
                        let inbound_kbps =
                            state.inbound_bytes as f64 * 8.0 / 1000.0 / elapsed_secs;
                        let outbound_kbps =
                            state.outbound_bytes as f64 * 8.0 / 1000.0 / elapsed_secs;
                        state.inbound_bytes = 0;
                        state.outbound_bytes = 0;
                        entry = state.json_stats();
                        entry["inbound_kbps"] = json!(inbound_kbps);
                        entry["outbound_kbps"] = json!(outbound_kbps);
                    }
                }
                avatars.insert(node.id().to_string(), entry);
            },
        );

        let record = build_stats_record(
            loop_rate,
            self.pool.num_threads(),
            self.throttle.trailing_mix_ratio(),
            self.throttle.ratio(),
            snapshot,
            slaves,
            serde_json::Value::Object(avatars),
        );
        self.stats_sink.publish(record);

        self.counters.add(
            &self.counters.send_stats_us,
            start.elapsed().as_micros() as u64,
        );
    }
}
