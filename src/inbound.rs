//! The inbound packet path.
//!
//! One call per UDP datagram: parse the overlay header, find the session,
//! authenticate, then branch by type. Relay frames addressed to us peel one
//! layer and restart dispatch on the wrapped packet; relay frames for someone
//! else are re-wrapped and forwarded. Per-packet failures never escape this
//! module, they are logged and the datagram is dropped.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::control::parse_control;
use crate::crypto::NONCE_LEN;
use crate::error::PacketError;
use crate::firewall::extract_packet;
use crate::header::{Header, MsgType, HEADER_LEN, SUBTYPE_NONE, SUBTYPE_RELAY, TEST_REPLY, TEST_REQUEST};
use crate::hostmap::{ConnectionState, HostInfo, RecvErrorCheck, RelayState, RelayType, RoamResult};
use crate::interface::{Interface, ViaSender, WorkerScratch};

impl Interface {
    /// Dispatch one datagram read from the outside socket.
    ///
    /// `addr` is the physical source, or `None` when re-dispatching a packet
    /// unwrapped from a relay frame; `via` carries the relay origin in that
    /// case so handshake replies can route back through it.
    pub fn read_outside_packets(
        &self,
        mut addr: Option<SocketAddr>,
        mut via: Option<ViaSender>,
        packet: &[u8],
        scratch: &mut WorkerScratch,
    ) {
        let mut packet = packet;
        let mut peeled = false;

        loop {
            let h = match Header::parse(packet) {
                Ok(h) => h,
                Err(e) => {
                    // Hole punch packets are 0 or 1 byte big, don't log those.
                    if packet.len() > 1 {
                        info!(
                            "Error while parsing inbound packet from {:?}: {} ({:02x?})",
                            addr, e, packet
                        );
                    }
                    return;
                }
            };

            // A physical source inside our own overlay subnet means the
            // datagram looped back through the mesh already encrypted once.
            if let Some(a) = addr {
                if let IpAddr::V4(ip4) = a.ip() {
                    if self.lighthouse.my_subnet_contains(ip4) {
                        debug!("Refusing to process double encrypted packet from {}", a);
                        return;
                    }
                }
            }

            let hostinfo = if h.msg_type == MsgType::Message && h.subtype == SUBTYPE_RELAY {
                self.hostmap.query_relay_index(h.remote_index)
            } else {
                self.hostmap.query_index(h.remote_index)
            };
            let ci = hostinfo.as_ref().and_then(|hi| hi.connection_state.as_ref());

            // Arms that authenticated a packet evaluate to the session host
            // and fall through to roaming and traffic accounting below.
            let tail_host: Arc<HostInfo> = match h.msg_type {
                MsgType::Message => {
                    self.metrics.rx(h.msg_type);
                    if !self.handle_encrypted(ci, addr, &h) {
                        return;
                    }
                    let host = hostinfo.expect("session verified by handle_encrypted");

                    match h.subtype {
                        SUBTYPE_NONE => {
                            if !self.decrypt_to_tun(&host, h.message_counter, packet, scratch) {
                                return;
                            }
                            host
                        }
                        SUBTYPE_RELAY => {
                            // The body before the tag is associated data, not
                            // ciphertext; the relay needs the inner header
                            // visible to route the frame.
                            let ci = host.connection_state.as_ref()
                                .expect("session verified by handle_encrypted");
                            let overhead = ci.decrypt_key().overhead();
                            if packet.len() < HEADER_LEN + overhead {
                                self.metrics.inc_drop_decrypt();
                                return;
                            }
                            let (signed_payload, tag) = packet.split_at(packet.len() - overhead);
                            if ci
                                .decrypt_key()
                                .verify_detached(signed_payload, tag, h.message_counter, &mut scratch.nb)
                                .is_err()
                            {
                                self.metrics.inc_drop_decrypt();
                                return;
                            }
                            let inner = &signed_payload[HEADER_LEN..];

                            // Roaming happens here; every relay path below
                            // either returns or restarts dispatch.
                            self.handle_host_roaming(&host, addr);
                            self.conn_manager.packet_in(host.local_index_id);

                            let Some(relay) = host.relay_state.query_by_local_index(h.remote_index)
                            else {
                                // The hostmap knew the index but the host
                                // itself does not: internal maps diverged.
                                error!(
                                    "Host {} missing remote relay index {}",
                                    host.vpn_ip, h.remote_index
                                );
                                self.metrics.inc_drop_relay();
                                return;
                            };

                            match relay.relay_type {
                                RelayType::Terminal => {
                                    if peeled {
                                        warn!(
                                            "Dropping nested relay frame from {}",
                                            host.vpn_ip
                                        );
                                        self.metrics.inc_drop_relay();
                                        return;
                                    }
                                    // We are the target: restart dispatch on
                                    // the wrapped packet. Everything bound to
                                    // the outer datagram is burned from here.
                                    peeled = true;
                                    via = Some(ViaSender {
                                        relay_host: host.clone(),
                                        remote_index: relay.remote_index,
                                        relay,
                                    });
                                    addr = None;
                                    packet = inner;
                                    scratch.out.clear();
                                    continue;
                                }
                                RelayType::Forwarding => {
                                    let Some(target) = self.hostmap.query_vpn_ip(relay.peer_ip)
                                    else {
                                        info!(
                                            "Failed to find relay target {} for {}",
                                            relay.peer_ip, host.vpn_ip
                                        );
                                        self.metrics.inc_drop_relay();
                                        return;
                                    };
                                    let Some(target_relay) =
                                        target.relay_state.query_by_peer_ip(host.vpn_ip)
                                    else {
                                        info!(
                                            "Failed to find relay from {} in host {}",
                                            host.vpn_ip, relay.peer_ip
                                        );
                                        self.metrics.inc_drop_relay();
                                        return;
                                    };

                                    if target_relay.state != RelayState::Established {
                                        info!(
                                            "Unexpected target relay state {:?} for {} -> {}",
                                            target_relay.state, host.vpn_ip, relay.peer_ip
                                        );
                                        self.metrics.inc_drop_relay();
                                        return;
                                    }
                                    match target_relay.relay_type {
                                        RelayType::Forwarding => {
                                            self.send_via(
                                                &target,
                                                &target_relay,
                                                inner,
                                                &mut scratch.nb,
                                                &mut scratch.txbuf,
                                            );
                                            return;
                                        }
                                        RelayType::Terminal => {
                                            error!(
                                                "Unexpected relay type of terminal for {}",
                                                target.vpn_ip
                                            );
                                            self.metrics.inc_drop_relay();
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                        other => {
                            // Unrecognized subtype on an admitted session:
                            // nothing to deliver, but the traffic still counts.
                            debug!("Unknown message subtype {} from {:?}", other, addr);
                            host
                        }
                    }
                }

                MsgType::LightHouse => {
                    self.metrics.rx(h.msg_type);
                    if !self.handle_encrypted(ci, addr, &h) {
                        return;
                    }
                    let host = hostinfo.expect("session verified by handle_encrypted");

                    let d = match self.decrypt(
                        &host,
                        h.message_counter,
                        &mut scratch.out,
                        packet,
                        &h,
                        &mut scratch.nb,
                    ) {
                        Ok(d) => d,
                        Err(PacketError::OutOfWindow) => return,
                        Err(e) => {
                            error!(
                                "Failed to decrypt lighthouse packet from {:?}: {} ({:02x?})",
                                addr, e, packet
                            );
                            return;
                        }
                    };

                    (self.lighthouse_callback)(addr, host.vpn_ip, d, self);
                    host
                }

                MsgType::Test => {
                    self.metrics.rx(h.msg_type);
                    if !self.handle_encrypted(ci, addr, &h) {
                        return;
                    }
                    let host = hostinfo.expect("session verified by handle_encrypted");

                    let d = match self.decrypt(
                        &host,
                        h.message_counter,
                        &mut scratch.out,
                        packet,
                        &h,
                        &mut scratch.nb,
                    ) {
                        Ok(d) => d,
                        Err(PacketError::OutOfWindow) => return,
                        Err(e) => {
                            error!(
                                "Failed to decrypt test packet from {:?}: {} ({:02x?})",
                                addr, e, packet
                            );
                            return;
                        }
                    };

                    if h.subtype == TEST_REQUEST {
                        // The probe may be exercising a candidate endpoint;
                        // roam first so the reply goes back where it came from.
                        self.handle_host_roaming(&host, addr);
                        self.send(
                            MsgType::Test,
                            TEST_REPLY,
                            &host,
                            d,
                            &mut scratch.nb,
                            &mut scratch.txbuf,
                        );
                    }
                    host
                }

                // Unauthenticated types below; none of them may fall through
                // to roaming or traffic accounting.
                MsgType::Handshake => {
                    self.metrics.rx(h.msg_type);
                    (self.handshake_callback)(self, addr, via.as_ref(), packet, &h, hostinfo);
                    return;
                }

                MsgType::RecvError => {
                    self.metrics.rx(h.msg_type);
                    self.handle_recv_error(addr, &h);
                    return;
                }

                MsgType::CloseTunnel => {
                    self.metrics.rx(h.msg_type);
                    if !self.handle_encrypted(ci, addr, &h) {
                        return;
                    }
                    let host = hostinfo.expect("session verified by handle_encrypted");
                    info!("Close tunnel received from {}, tearing down.", host.vpn_ip);
                    self.close_tunnel(&host);
                    return;
                }

                MsgType::Control => {
                    self.metrics.rx(h.msg_type);
                    if !self.handle_encrypted(ci, addr, &h) {
                        return;
                    }
                    let host = hostinfo.expect("session verified by handle_encrypted");

                    let d = match self.decrypt(
                        &host,
                        h.message_counter,
                        &mut scratch.out,
                        packet,
                        &h,
                        &mut scratch.nb,
                    ) {
                        Ok(d) => d,
                        Err(PacketError::OutOfWindow) => return,
                        Err(e) => {
                            error!(
                                "Failed to decrypt control packet from {:?}: {} ({:02x?})",
                                addr, e, packet
                            );
                            return;
                        }
                    };

                    match parse_control(d) {
                        Ok(msg) => self.relay_manager.handle_control_msg(&host, &msg, self),
                        Err(e) => {
                            error!("Failed to unmarshal control message from {}: {}", host.vpn_ip, e)
                        }
                    }
                    host
                }

                MsgType::Unknown(_) => {
                    self.metrics.rx(h.msg_type);
                    debug!("Unexpected packet received from {:?}", addr);
                    return;
                }
            };

            self.handle_host_roaming(&tail_host, addr);
            self.conn_manager.packet_in(tail_host.local_index_id);
            return;
        }
    }

    /// Gate for all encrypted types: a session must exist and the counter
    /// must still be admissible. On failure, answer unknown senders with a
    /// tombstone so they can reconnect quickly after our restart.
    fn handle_encrypted(
        &self,
        ci: Option<&ConnectionState>,
        addr: Option<SocketAddr>,
        h: &Header,
    ) -> bool {
        let admissible = match ci {
            Some(ci) => {
                let ok = ci.window_check(h.message_counter);
                if !ok {
                    self.metrics.inc_drop_replay();
                }
                ok
            }
            None => false,
        };

        if !admissible {
            if let Some(addr) = addr {
                self.maybe_send_recv_error(addr, h.remote_index);
            }
            return false;
        }
        true
    }

    /// AEAD-decrypt an encrypted frame and commit its counter.
    fn decrypt<'a>(
        &self,
        hostinfo: &HostInfo,
        counter: u64,
        out: &'a mut Vec<u8>,
        packet: &[u8],
        h: &Header,
        nb: &mut [u8; NONCE_LEN],
    ) -> Result<&'a [u8], PacketError> {
        let ci = hostinfo
            .connection_state
            .as_ref()
            .ok_or(PacketError::DecryptionFailed)?;

        ci.decrypt_key()
            .decrypt(out, &packet[..HEADER_LEN], &packet[HEADER_LEN..], counter, nb)
            .inspect_err(|_| self.metrics.inc_drop_decrypt())?;

        if !ci.window_update(counter) {
            debug!("Dropping out of window packet: {:?}", h);
            self.metrics.inc_drop_replay();
            return Err(PacketError::OutOfWindow);
        }

        Ok(out.as_slice())
    }

    /// Decrypt a data frame, run it past the firewall, and deliver it to the
    /// TUN device. Returns whether the frame authenticated; drops past that
    /// point still count as authenticated traffic for roaming purposes.
    fn decrypt_to_tun(
        &self,
        hostinfo: &Arc<HostInfo>,
        counter: u64,
        packet: &[u8],
        scratch: &mut WorkerScratch,
    ) -> bool {
        let ci = hostinfo
            .connection_state
            .as_ref()
            .expect("session verified by handle_encrypted");

        if let Err(e) = ci.decrypt_key().decrypt(
            &mut scratch.out,
            &packet[..HEADER_LEN],
            &packet[HEADER_LEN..],
            counter,
            &mut scratch.nb,
        ) {
            error!(
                "Failed to decrypt packet from {:?}: {} ({:02x?})",
                hostinfo.remote(),
                e,
                packet
            );
            self.metrics.inc_drop_decrypt();
            return false;
        }

        if let Err(e) = extract_packet(&scratch.out, true, &mut scratch.fw_packet) {
            warn!(
                "Error while validating inbound packet from {}: {}",
                hostinfo.vpn_ip, e
            );
            return true;
        }

        if !ci.window_update(counter) {
            debug!("Dropping out of window packet: {:?}", scratch.fw_packet);
            self.metrics.inc_drop_replay();
            return true;
        }

        if let Some(reason) = self.firewall.drop_inbound(
            &scratch.out,
            &scratch.fw_packet,
            hostinfo,
            &mut scratch.conntrack,
        ) {
            debug!(
                "Dropping inbound packet from {}: {} ({:?})",
                hostinfo.vpn_ip, reason, scratch.fw_packet
            );
            self.metrics.inc_drop_firewall();
            return true;
        }

        self.conn_manager.packet_in(hostinfo.local_index_id);
        if let Err(e) = self.inside.write(scratch.queue, &scratch.out) {
            error!("Failed to write to tun: {}", e);
        }
        true
    }

    /// An authenticated packet arrived from somewhere other than the
    /// remembered remote: move the session there, unless the allow list or
    /// the bounce suppression says otherwise.
    pub(crate) fn handle_host_roaming(&self, hostinfo: &HostInfo, addr: Option<SocketAddr>) {
        let Some(addr) = addr else {
            return;
        };
        if hostinfo.remote() == Some(addr) {
            return;
        }

        if !self
            .lighthouse
            .remote_allow_list()
            .allow(hostinfo.vpn_ip, addr.ip())
        {
            debug!(
                "Remote allow list denied roaming of {} to {}",
                hostinfo.vpn_ip, addr
            );
            return;
        }

        match hostinfo.apply_roam(addr, self.roaming_suppress) {
            RoamResult::Unchanged => {}
            RoamResult::Suppressed => {
                debug!(
                    "Suppressing roam of {} back to previous remote {}",
                    hostinfo.vpn_ip, addr
                );
            }
            RoamResult::Roamed { previous } => {
                info!(
                    "Host {} roamed to new udp ip/port {} (was {:?})",
                    hostinfo.vpn_ip, addr, previous
                );
            }
        }
    }

    /// A peer told us it no longer knows the session index we used. The
    /// message is unsigned, so it takes several of them from the right
    /// endpoint before we act.
    pub(crate) fn handle_recv_error(&self, addr: Option<SocketAddr>, h: &Header) {
        debug!("Recv error received from {:?} for index {}", addr, h.remote_index);

        // A half-open handshake for that index is cheap to throw away.
        self.handshake_manager.delete_reverse_index(h.remote_index);

        let Some(hostinfo) = self.hostmap.query_reverse_index(h.remote_index) else {
            debug!("No host found for recv error index {}", h.remote_index);
            return;
        };

        match hostinfo.check_recv_error(addr) {
            RecvErrorCheck::BelowThreshold => {}
            RecvErrorCheck::AddressMismatch { expected } => {
                info!(
                    "Someone spoofing recv_errors? {:?} (expected {})",
                    addr, expected
                );
            }
            RecvErrorCheck::Teardown => {
                self.close_tunnel(&hostinfo);
                // Also forget any pending handshake so the peer can
                // reconnect immediately.
                self.handshake_manager.delete_host(&hostinfo);
            }
        }
    }

    /// Tear a tunnel down locally. Does not notify the remote.
    pub(crate) fn close_tunnel(&self, hostinfo: &Arc<HostInfo>) {
        self.conn_manager.clear_local_index(hostinfo.local_index_id);
        self.conn_manager.clear_pending_deletion(hostinfo.local_index_id);
        let last = self.hostmap.delete_host(hostinfo);
        if last {
            // No tunnels left with this address; learned discovery state
            // would only pin stale endpoints.
            self.lighthouse.delete_vpn_ip(hostinfo.vpn_ip);
        }
    }
}
