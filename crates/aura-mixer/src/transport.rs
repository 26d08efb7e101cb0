//! Transport seam
//!
//! The mixer core talks to the wire through `PacketSink`. The deployment
//! front end is a UDP socket with a blocking receive thread; reliability
//! and list reassembly for the flagged kinds belong to the session
//! transport layered on top, which is outside this process. Tests use a
//! capture sink and inspect exactly what would have hit the wire.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use aura_core::NodeId;
use aura_wire::{PacketKind, WirePacket};

use crate::{AvatarMixer, MixerNode};

/// Outbound packet sink.
pub trait PacketSink: Send + Sync {
    /// Send one packet to one node. `reliable` is the channel class the
    /// kind calls for; the datagram front end treats both the same.
    fn send_to(&self, packet: &WirePacket, node: &MixerNode, reliable: bool);
}

/// UDP datagram sink.
pub struct UdpSink {
    socket: UdpSocket,
}

impl UdpSink {
    pub fn new(socket: UdpSocket) -> Self {
        UdpSink { socket }
    }
}

impl PacketSink for UdpSink {
    fn send_to(&self, packet: &WirePacket, node: &MixerNode, _reliable: bool) {
        let Some(addr) = node.active_socket() else {
            return;
        };
        if let Err(error) = self.socket.send_to(&packet.bytes, addr) {
            warn!(%addr, %error, "UDP send error");
        }
    }
}

/// One captured send, for tests.
#[derive(Clone, Debug)]
pub struct SentPacket {
    pub to: NodeId,
    pub kind: PacketKind,
    pub reliable: bool,
    pub bytes: Vec<u8>,
}

/// Records every send instead of hitting a socket.
pub struct CaptureSink {
    sent: Mutex<Vec<SentPacket>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        CaptureSink {
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Drain everything captured so far.
    pub fn take(&self) -> Vec<SentPacket> {
        std::mem::take(&mut self.sent.lock())
    }

    /// Captured packets of `kind` addressed to `to`, without draining.
    pub fn sent_to(&self, to: NodeId, kind: PacketKind) -> Vec<SentPacket> {
        self.sent
            .lock()
            .iter()
            .filter(|p| p.to == to && p.kind == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: PacketKind) -> usize {
        self.sent.lock().iter().filter(|p| p.kind == kind).count()
    }
}

impl Default for CaptureSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSink for CaptureSink {
    fn send_to(&self, packet: &WirePacket, node: &MixerNode, reliable: bool) {
        self.sent.lock().push(SentPacket {
            to: node.id(),
            kind: packet.kind,
            reliable,
            bytes: packet.bytes.clone(),
        });
    }
}

/// Blocking receive loop; owns the socket until `running` clears.
///
/// Datagram in, `handle_datagram` out - all further dispatch happens on
/// this thread (the "receive thread" of the concurrency model).
pub fn run_receive_loop(socket: UdpSocket, mixer: Arc<AvatarMixer>, running: Arc<AtomicBool>) {
    // wake periodically so a stop request is noticed
    if let Err(error) = socket.set_read_timeout(Some(Duration::from_millis(250))) {
        warn!(%error, "could not set receive timeout");
    }

    let mut buf = vec![0u8; 65_536];
    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                mixer.handle_datagram(&buf[..len], from);
            }
            Err(error)
                if error.kind() == std::io::ErrorKind::WouldBlock
                    || error.kind() == std::io::ErrorKind::TimedOut => {}
            Err(error) => {
                warn!(%error, "UDP receive error");
            }
        }
    }
}

/// Resolvable bind helper for the binary.
pub fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    UdpSocket::bind(addr)
}
