//! Session and peer state: host info, transport keys, relay bookkeeping.
//!
//! The [`Hostmap`] maps session indices and overlay addresses to [`HostInfo`]
//! entries. Lookups take the map's read lock briefly; per-host mutable state
//! (remote endpoint, roaming history, recv-error counter) sits behind each
//! host's own lock so packet workers never hold the map lock while mutating
//! a host.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::crypto::SessionCipher;
use crate::replay::ReplayWindow;

/// Accepted recv-errors beyond this count tear the tunnel down.
pub const MAX_RECV_ERRORS: u32 = 3;

/// Established transport keys plus the replay window for one session.
pub struct ConnectionState {
    dkey: SessionCipher,
    ekey: SessionCipher,
    window: Mutex<ReplayWindow>,
    message_counter: AtomicU64,
}

impl ConnectionState {
    pub fn new(decrypt_key: &[u8; 32], encrypt_key: &[u8; 32]) -> Self {
        Self {
            dkey: SessionCipher::new(decrypt_key),
            ekey: SessionCipher::new(encrypt_key),
            window: Mutex::new(ReplayWindow::default()),
            message_counter: AtomicU64::new(0),
        }
    }

    pub fn decrypt_key(&self) -> &SessionCipher {
        &self.dkey
    }

    pub fn encrypt_key(&self) -> &SessionCipher {
        &self.ekey
    }

    /// Cheap admission test before any crypto work. Non-destructive.
    pub fn window_check(&self, counter: u64) -> bool {
        self.window.lock().unwrap().check(counter)
    }

    /// Commit a counter after successful AEAD. The losing side of a race
    /// between workers on the same session gets `false` and drops.
    pub fn window_update(&self, counter: u64) -> bool {
        self.window.lock().unwrap().update(counter)
    }

    /// Next outbound message counter. Starts at 1; counter 0 is never sent.
    pub fn next_counter(&self) -> u64 {
        self.message_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Whether a relay entry terminates at this host or forwards through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayType {
    Terminal,
    Forwarding,
}

/// Lifecycle of a relay leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    PendingHandshake,
    Established,
}

/// One relay leg as seen by one host.
#[derive(Debug, Clone, Copy)]
pub struct Relay {
    pub relay_type: RelayType,
    pub state: RelayState,
    /// Overlay address of the far end of the relayed tunnel.
    pub peer_ip: Ipv4Addr,
    /// Our index on this relay leg; what the peer puts in `remote_index`.
    pub local_index: u32,
    /// The peer's index on this relay leg; what we put in `remote_index`.
    pub remote_index: u32,
}

/// Per-host relay table, indexed by our local leg index and by the far
/// peer's overlay address.
#[derive(Default)]
pub struct RelayTracker {
    inner: RwLock<RelayTrackerInner>,
}

#[derive(Default)]
struct RelayTrackerInner {
    by_local_index: HashMap<u32, Relay>,
    by_peer_ip: HashMap<Ipv4Addr, Relay>,
}

impl RelayTracker {
    pub fn insert(&self, relay: Relay) {
        let mut inner = self.inner.write().unwrap();
        inner.by_local_index.insert(relay.local_index, relay);
        inner.by_peer_ip.insert(relay.peer_ip, relay);
    }

    pub fn query_by_local_index(&self, idx: u32) -> Option<Relay> {
        self.inner.read().unwrap().by_local_index.get(&idx).copied()
    }

    pub fn query_by_peer_ip(&self, ip: Ipv4Addr) -> Option<Relay> {
        self.inner.read().unwrap().by_peer_ip.get(&ip).copied()
    }

    /// Mark the leg established and record the peer's index for it.
    pub fn establish(&self, local_index: u32, remote_index: u32) -> bool {
        let mut inner = self.inner.write().unwrap();
        let Some(relay) = inner.by_local_index.get_mut(&local_index) else {
            return false;
        };
        relay.state = RelayState::Established;
        relay.remote_index = remote_index;
        let updated = *relay;
        inner.by_peer_ip.insert(updated.peer_ip, updated);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().by_local_index.is_empty()
    }
}

/// Verdict on a received recv-error tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvErrorCheck {
    /// Not enough tombstones yet to act.
    BelowThreshold,
    /// Sender does not match the session's remembered remote.
    AddressMismatch { expected: SocketAddr },
    /// Threshold passed and the sender checks out; tear the tunnel down.
    Teardown,
}

/// Outcome of a roaming attempt, under the host lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoamResult {
    /// Address already matches the remembered remote.
    Unchanged,
    /// Bounce back to the previous remote inside the suppression window.
    Suppressed,
    /// Remote replaced; carries the endpoint it replaced.
    Roamed { previous: Option<SocketAddr> },
}

struct HostDynamic {
    remote: Option<SocketAddr>,
    last_roam: Option<Instant>,
    last_roam_remote: Option<SocketAddr>,
    recv_errors: u32,
}

/// Everything we know about one established (or establishing) peer session.
pub struct HostInfo {
    pub vpn_ip: Ipv4Addr,
    /// Our 32-bit handle for this session; peers address us with it.
    pub local_index_id: u32,
    /// The peer's handle for this session.
    pub remote_index_id: u32,
    /// Present once the handshake has produced keys.
    pub connection_state: Option<ConnectionState>,
    pub relay_state: RelayTracker,
    dynamic: Mutex<HostDynamic>,
}

impl HostInfo {
    pub fn new(
        vpn_ip: Ipv4Addr,
        local_index_id: u32,
        remote_index_id: u32,
        remote: Option<SocketAddr>,
        connection_state: Option<ConnectionState>,
    ) -> Self {
        Self {
            vpn_ip,
            local_index_id,
            remote_index_id,
            connection_state,
            relay_state: RelayTracker::default(),
            dynamic: Mutex::new(HostDynamic {
                remote,
                last_roam: None,
                last_roam_remote: None,
                recv_errors: 0,
            }),
        }
    }

    /// Currently remembered physical endpoint.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.dynamic.lock().unwrap().remote
    }

    pub fn set_remote(&self, addr: SocketAddr) {
        self.dynamic.lock().unwrap().remote = Some(addr);
    }

    /// Replace the remembered remote with `addr` unless it matches already
    /// or this is a bounce back to the previous remote within `suppress`.
    /// The caller has already consulted the allow list.
    pub fn apply_roam(&self, addr: SocketAddr, suppress: Duration) -> RoamResult {
        let mut dynamic = self.dynamic.lock().unwrap();

        if dynamic.remote == Some(addr) {
            return RoamResult::Unchanged;
        }

        if let (Some(last), Some(last_remote)) = (dynamic.last_roam, dynamic.last_roam_remote) {
            if last_remote == addr && last.elapsed() < suppress {
                return RoamResult::Suppressed;
            }
        }

        let previous = dynamic.remote;
        dynamic.last_roam = Some(Instant::now());
        dynamic.last_roam_remote = previous;
        dynamic.remote = Some(addr);
        RoamResult::Roamed { previous }
    }

    /// Count one received recv-error and decide, under the host lock, whether
    /// it authorizes teardown. A single unauthenticated tombstone is never
    /// enough, and the sender must match the remembered remote.
    pub fn check_recv_error(&self, addr: Option<SocketAddr>) -> RecvErrorCheck {
        let mut dynamic = self.dynamic.lock().unwrap();
        dynamic.recv_errors += 1;
        if dynamic.recv_errors <= MAX_RECV_ERRORS {
            return RecvErrorCheck::BelowThreshold;
        }
        if let Some(remote) = dynamic.remote {
            if addr != Some(remote) {
                return RecvErrorCheck::AddressMismatch { expected: remote };
            }
        }
        RecvErrorCheck::Teardown
    }
}

#[derive(Default)]
struct HostmapInner {
    /// Our local session index -> host.
    indexes: HashMap<u32, Arc<HostInfo>>,
    /// The peer's session index -> host.
    remote_indexes: HashMap<u32, Arc<HostInfo>>,
    /// Our local index on a relay leg -> host carrying that relay entry.
    relay_indexes: HashMap<u32, Arc<HostInfo>>,
    /// Overlay address -> host.
    hosts: HashMap<Ipv4Addr, Arc<HostInfo>>,
}

/// Concurrent bidirectional session map.
#[derive(Default)]
pub struct Hostmap {
    inner: RwLock<HostmapInner>,
}

impl Hostmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, host: Arc<HostInfo>) {
        let mut inner = self.inner.write().unwrap();
        inner.indexes.insert(host.local_index_id, host.clone());
        inner.remote_indexes.insert(host.remote_index_id, host.clone());
        inner.hosts.insert(host.vpn_ip, host);
    }

    /// Register a relay leg index pointing at the host that owns the entry.
    pub fn add_relay_index(&self, idx: u32, host: Arc<HostInfo>) {
        self.inner.write().unwrap().relay_indexes.insert(idx, host);
    }

    pub fn query_index(&self, idx: u32) -> Option<Arc<HostInfo>> {
        self.inner.read().unwrap().indexes.get(&idx).cloned()
    }

    pub fn query_relay_index(&self, idx: u32) -> Option<Arc<HostInfo>> {
        self.inner.read().unwrap().relay_indexes.get(&idx).cloned()
    }

    /// Look up by the index the *peer* uses for the session. The recv-error
    /// path resolves tombstones this way.
    pub fn query_reverse_index(&self, idx: u32) -> Option<Arc<HostInfo>> {
        self.inner.read().unwrap().remote_indexes.get(&idx).cloned()
    }

    pub fn query_vpn_ip(&self, ip: Ipv4Addr) -> Option<Arc<HostInfo>> {
        self.inner.read().unwrap().hosts.get(&ip).cloned()
    }

    pub fn delete_reverse_index(&self, idx: u32) {
        self.inner.write().unwrap().remote_indexes.remove(&idx);
    }

    /// Remove a host from every index. Returns true when this was the last
    /// session for its overlay address.
    pub fn delete_host(&self, host: &Arc<HostInfo>) -> bool {
        let mut inner = self.inner.write().unwrap();
        inner.indexes.remove(&host.local_index_id);
        inner.remote_indexes.remove(&host.remote_index_id);
        inner
            .relay_indexes
            .retain(|_, h| !Arc::ptr_eq(h, host));

        if let Some(existing) = inner.hosts.get(&host.vpn_ip) {
            if Arc::ptr_eq(existing, host) {
                inner.hosts.remove(&host.vpn_ip);
            }
        }
        !inner.hosts.contains_key(&host.vpn_ip)
    }

    /// Snapshot of every live host, for maintenance sweeps and shutdown.
    pub fn all_hosts(&self) -> Vec<Arc<HostInfo>> {
        self.inner.read().unwrap().hosts.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
