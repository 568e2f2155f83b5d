//! The interface: every collaborator the packet path needs, wired together.
//!
//! Nothing here is a process global; the daemon builds one [`Interface`] and
//! hands it to the workers. The UDP socket and TUN device sit behind small
//! write traits so tests can capture traffic in memory.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use crate::conn_manager::ConnectionManager;
use crate::control::RelayManager;
use crate::crypto::NONCE_LEN;
use crate::firewall::{ConntrackCache, Firewall, Packet};
use crate::handshake::HandshakeManager;
use crate::header::{Header, MsgType, HEADER_LEN, SUBTYPE_NONE};
use crate::hostmap::{HostInfo, Hostmap, Relay};
use crate::lighthouse::Lighthouse;
use crate::metrics::Metrics;
use crate::ratelimit::{RecvErrorConfig, RecvErrorLimiter};

/// How long a roam back to the previous endpoint is suppressed.
pub const ROAMING_SUPPRESS: Duration = Duration::from_secs(2);

/// Writes datagrams toward the physical network.
pub trait OutsideWriter: Send + Sync {
    fn write_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()>;
}

impl OutsideWriter for UdpSocket {
    fn write_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.send_to(data, addr).map(|_| ())
    }
}

/// Writes decrypted IP datagrams into the local TUN device, one writer per
/// worker queue.
pub trait InsideWriter: Send + Sync {
    fn write(&self, queue: usize, data: &[u8]) -> io::Result<usize>;
}

/// Synthetic origin for a packet unwrapped from a relay frame. The next
/// dispatch pass must not roam on it, and handshake replies go back through
/// the relay.
pub struct ViaSender {
    pub relay_host: Arc<HostInfo>,
    pub remote_index: u32,
    pub relay: Relay,
}

/// Invoked with the decrypted payload of a lighthouse frame.
pub type LighthouseCallback =
    Box<dyn Fn(Option<SocketAddr>, Ipv4Addr, &[u8], &Interface) + Send + Sync>;

/// Invoked with raw handshake datagrams; may mutate the hostmap.
pub type HandshakeCallback = Box<
    dyn Fn(&Interface, Option<SocketAddr>, Option<&ViaSender>, &[u8], &Header, Option<Arc<HostInfo>>)
        + Send
        + Sync,
>;

/// Per-worker scratch state. Buffers are re-sliced per packet, never
/// reallocated, and never shared across workers.
pub struct WorkerScratch {
    /// Worker queue index, selects the TUN writer.
    pub queue: usize,
    /// Plaintext output buffer.
    pub out: Vec<u8>,
    /// Outbound wire buffer for replies sent from the packet path.
    pub txbuf: Vec<u8>,
    /// AEAD nonce scratch.
    pub nb: [u8; NONCE_LEN],
    /// Firewall tuple scratch.
    pub fw_packet: Packet,
    /// This worker's private conntrack cache.
    pub conntrack: ConntrackCache,
}

impl WorkerScratch {
    pub fn new(queue: usize) -> Self {
        Self {
            queue,
            out: Vec::with_capacity(u16::MAX as usize),
            txbuf: Vec::with_capacity(u16::MAX as usize),
            nb: [0u8; NONCE_LEN],
            fw_packet: Packet::default(),
            conntrack: ConntrackCache::default(),
        }
    }
}

/// Collaborators handed to [`Interface::new`].
pub struct InterfaceDeps {
    pub hostmap: Arc<Hostmap>,
    pub handshake_manager: Arc<HandshakeManager>,
    pub lighthouse: Arc<Lighthouse>,
    pub conn_manager: Arc<ConnectionManager>,
    pub relay_manager: Arc<RelayManager>,
    pub firewall: Arc<dyn Firewall>,
    pub metrics: Arc<Metrics>,
    pub outside: Arc<dyn OutsideWriter>,
    pub inside: Arc<dyn InsideWriter>,
    pub lighthouse_callback: LighthouseCallback,
    pub handshake_callback: HandshakeCallback,
    pub recv_error: RecvErrorConfig,
    pub roaming_suppress: Duration,
}

/// Aggregate of everything the inbound path touches.
pub struct Interface {
    pub hostmap: Arc<Hostmap>,
    pub handshake_manager: Arc<HandshakeManager>,
    pub lighthouse: Arc<Lighthouse>,
    pub conn_manager: Arc<ConnectionManager>,
    pub relay_manager: Arc<RelayManager>,
    pub firewall: Arc<dyn Firewall>,
    pub metrics: Arc<Metrics>,
    pub(crate) outside: Arc<dyn OutsideWriter>,
    pub(crate) inside: Arc<dyn InsideWriter>,
    pub(crate) lighthouse_callback: LighthouseCallback,
    pub(crate) handshake_callback: HandshakeCallback,
    pub(crate) recv_error_limiter: RecvErrorLimiter,
    pub(crate) roaming_suppress: Duration,
}

impl Interface {
    pub fn new(deps: InterfaceDeps) -> Self {
        Self {
            hostmap: deps.hostmap,
            handshake_manager: deps.handshake_manager,
            lighthouse: deps.lighthouse,
            conn_manager: deps.conn_manager,
            relay_manager: deps.relay_manager,
            firewall: deps.firewall,
            metrics: deps.metrics,
            outside: deps.outside,
            inside: deps.inside,
            lighthouse_callback: deps.lighthouse_callback,
            handshake_callback: deps.handshake_callback,
            recv_error_limiter: RecvErrorLimiter::new(deps.recv_error),
            roaming_suppress: deps.roaming_suppress,
        }
    }

    /// Encrypt `payload` under `hostinfo`'s session and send it to the
    /// remembered remote. Silently drops when the session has no keys or no
    /// endpoint yet.
    pub fn send(
        &self,
        t: MsgType,
        subtype: u8,
        hostinfo: &HostInfo,
        payload: &[u8],
        nb: &mut [u8; NONCE_LEN],
        out: &mut Vec<u8>,
    ) {
        let Some(ci) = hostinfo.connection_state.as_ref() else {
            return;
        };
        let Some(remote) = hostinfo.remote() else {
            debug!("No remote endpoint for {}, dropping outbound {}", hostinfo.vpn_ip, t);
            return;
        };

        let counter = ci.next_counter();
        let header = Header::new(t, subtype, hostinfo.remote_index_id, counter);
        let mut ad = [0u8; HEADER_LEN];
        header.encode(&mut ad).expect("header buffer is HEADER_LEN");

        out.clear();
        out.extend_from_slice(&ad);
        if ci.encrypt_key().encrypt(out, &ad, payload, counter, nb).is_err() {
            return;
        }

        self.metrics.tx(t);
        if let Err(e) = self.outside.write_to(out, remote) {
            debug!("Failed to send {} to {}: {}", t, remote, e);
        }
    }

    /// Wrap `payload` in a relay frame for `relay` and send it to `target`.
    /// The payload is authenticated, not encrypted; the relay needs the
    /// inner header visible to route it.
    pub fn send_via(
        &self,
        target: &HostInfo,
        relay: &Relay,
        payload: &[u8],
        nb: &mut [u8; NONCE_LEN],
        out: &mut Vec<u8>,
    ) {
        let Some(ci) = target.connection_state.as_ref() else {
            return;
        };
        let Some(remote) = target.remote() else {
            debug!("No remote endpoint for relay target {}", target.vpn_ip);
            return;
        };

        let counter = ci.next_counter();
        let header = Header::new(MsgType::Message, crate::header::SUBTYPE_RELAY, relay.remote_index, counter);

        out.clear();
        out.resize(HEADER_LEN, 0);
        header.encode(out).expect("header buffer is HEADER_LEN");
        out.extend_from_slice(payload);

        let Ok(tag) = ci.encrypt_key().tag_detached(out, counter, nb) else {
            return;
        };
        out.extend_from_slice(&tag);

        self.metrics.tx(MsgType::Message);
        if let Err(e) = self.outside.write_to(out, remote) {
            debug!("Failed to relay to {}: {}", remote, e);
        }
    }

    /// Send a header-only recv-error tombstone if the limiter allows it.
    pub fn maybe_send_recv_error(&self, endpoint: SocketAddr, index: u32) {
        if self.recv_error_limiter.should_send(endpoint.ip()) {
            self.send_recv_error(endpoint, index);
        }
    }

    pub fn send_recv_error(&self, endpoint: SocketAddr, index: u32) {
        self.metrics.tx(MsgType::RecvError);

        // Unsigned: receivers only treat this as advisory.
        let header = Header::new(MsgType::RecvError, SUBTYPE_NONE, index, 0);
        let buf = header.to_bytes();
        if let Err(e) = self.outside.write_to(&buf, endpoint) {
            debug!("Failed to send recv error to {}: {}", endpoint, e);
            return;
        }
        debug!("Recv error sent to {} for index {}", endpoint, index);
    }

    /// Tell a peer we are closing, then it is up to them to tear down.
    pub fn send_close_tunnel(&self, hostinfo: &HostInfo) {
        let mut nb = [0u8; NONCE_LEN];
        let mut out = Vec::new();
        self.send(MsgType::CloseTunnel, SUBTYPE_NONE, hostinfo, &[], &mut nb, &mut out);
    }

    /// Periodic housekeeping; cheap enough to run from a timer task.
    pub fn cleanup(&self) {
        self.recv_error_limiter.cleanup();
    }
}

/// In-memory [`OutsideWriter`] capturing sent datagrams; test seam.
#[derive(Default)]
pub struct MemoryOutside {
    pub sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl OutsideWriter for MemoryOutside {
    fn write_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.sent.lock().unwrap().push((data.to_vec(), addr));
        Ok(())
    }
}

/// In-memory [`InsideWriter`] capturing TUN writes; test seam.
#[derive(Default)]
pub struct MemoryInside {
    pub written: Mutex<Vec<Vec<u8>>>,
}

impl InsideWriter for MemoryInside {
    fn write(&self, _queue: usize, data: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }
}
