//! Handshake-manager contract.
//!
//! The Noise state machine itself lives outside the packet path; the
//! dispatcher hands handshake datagrams to an injected callback. What the
//! inbound core does own is the pending-session table that the recv-error
//! path has to clean up so peers can reconnect immediately after a teardown.

use std::sync::Arc;

use crate::hostmap::{HostInfo, Hostmap};

/// Sessions mid-handshake, indexed like established ones.
#[derive(Default)]
pub struct HandshakeManager {
    pending: Hostmap,
}

impl HandshakeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &Hostmap {
        &self.pending
    }

    pub fn add_pending(&self, host: Arc<HostInfo>) {
        self.pending.add(host);
    }

    /// Drop a half-open session by the index the peer knows it under.
    pub fn delete_reverse_index(&self, idx: u32) {
        self.pending.delete_reverse_index(idx);
    }

    /// Remove every trace of a host from the pending table so a fresh
    /// handshake can start at once.
    pub fn delete_host(&self, host: &Arc<HostInfo>) {
        self.pending.delete_host(host);
    }
}
