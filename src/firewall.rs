//! Firewall packet extraction and the firewall decision seam.
//!
//! The inbound path hands every decrypted IPv4 datagram to the firewall as a
//! locally oriented 5-tuple. The firewall itself is a collaborator behind the
//! [`Firewall`] trait; this module owns the tuple extraction and the per-worker
//! conntrack cache type.

use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;

use crate::error::PacketError;
use crate::hostmap::HostInfo;

/// Minimum IPv4 header length.
pub const IPV4_HEADER_LEN: usize = 20;
/// Bytes of transport header needed for the port tuple.
pub const MIN_FW_PACKET_LEN: usize = 4;

/// IP protocol numbers the firewall cares about by name.
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Locally oriented 5-tuple extracted from an inner IPv4 datagram.
///
/// "Local" and "remote" are from the receiver's viewpoint and swap for the
/// outbound direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Packet {
    pub local_ip: u32,
    pub remote_ip: u32,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: u8,
    /// True for the second and further fragments, which carry no transport
    /// header and therefore no ports.
    pub fragment: bool,
}

impl Packet {
    pub fn local_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.local_ip)
    }

    pub fn remote_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.remote_ip)
    }
}

/// Validate an IPv4 datagram and extract the firewall tuple into `fp`.
pub fn extract_packet(data: &[u8], incoming: bool, fp: &mut Packet) -> Result<(), PacketError> {
    if data.len() < IPV4_HEADER_LEN {
        return Err(PacketError::MalformedInnerPacket(format!(
            "packet is less than {} bytes",
            IPV4_HEADER_LEN
        )));
    }

    let version = data[0] >> 4;
    if version != 4 {
        return Err(PacketError::MalformedInnerPacket(format!(
            "packet is not ipv4, type: {}",
            version
        )));
    }

    let ihl = usize::from(data[0] & 0x0f) << 2;
    if ihl < IPV4_HEADER_LEN {
        return Err(PacketError::MalformedInnerPacket(format!(
            "packet had an invalid header length: {}",
            ihl
        )));
    }

    let flags_frags = u16::from_be_bytes([data[6], data[7]]);
    fp.fragment = (flags_frags & 0x1fff) != 0;

    fp.protocol = data[9];

    // A variable-length header still has to leave room for the port tuple,
    // except when there are no ports to read.
    let mut min_len = ihl;
    if !fp.fragment && fp.protocol != PROTO_ICMP {
        min_len += MIN_FW_PACKET_LEN;
    }
    if data.len() < min_len {
        return Err(PacketError::MalformedInnerPacket(format!(
            "packet is less than {} bytes, ip header len: {}",
            min_len, ihl
        )));
    }

    let src = u32::from_be_bytes(data[12..16].try_into().unwrap());
    let dst = u32::from_be_bytes(data[16..20].try_into().unwrap());

    if incoming {
        fp.remote_ip = src;
        fp.local_ip = dst;
    } else {
        fp.local_ip = src;
        fp.remote_ip = dst;
    }

    if fp.fragment || fp.protocol == PROTO_ICMP {
        fp.remote_port = 0;
        fp.local_port = 0;
    } else {
        let first = u16::from_be_bytes([data[ihl], data[ihl + 1]]);
        let second = u16::from_be_bytes([data[ihl + 2], data[ihl + 3]]);
        if incoming {
            fp.remote_port = first;
            fp.local_port = second;
        } else {
            fp.local_port = first;
            fp.remote_port = second;
        }
    }

    Ok(())
}

/// Per-worker cache of recently allowed tuples. Never shared across workers.
pub struct ConntrackCache {
    entries: LruCache<Packet, Instant>,
}

impl ConntrackCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
        }
    }

    pub fn hit(&mut self, fp: &Packet) -> bool {
        self.entries.get(fp).is_some()
    }

    pub fn record(&mut self, fp: Packet) {
        self.entries.put(fp, Instant::now());
    }
}

impl Default for ConntrackCache {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// Why the firewall refused a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoMatchingRule,
    PeerRejected,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::NoMatchingRule => write!(f, "no matching rule"),
            DropReason::PeerRejected => write!(f, "peer rejected"),
        }
    }
}

/// Stateful packet-admission oracle consulted after decryption.
pub trait Firewall: Send + Sync {
    /// Return a reason to drop, or `None` to deliver. `cache` is the calling
    /// worker's private conntrack cache.
    fn drop_inbound(
        &self,
        data: &[u8],
        fp: &Packet,
        host: &HostInfo,
        cache: &mut ConntrackCache,
    ) -> Option<DropReason>;
}

/// Firewall that admits everything. Used when no policy is configured.
pub struct AllowAll;

impl Firewall for AllowAll {
    fn drop_inbound(
        &self,
        _data: &[u8],
        fp: &Packet,
        _host: &HostInfo,
        cache: &mut ConntrackCache,
    ) -> Option<DropReason> {
        cache.record(*fp);
        None
    }
}
