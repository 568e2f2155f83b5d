//! Relay-control messages and the relay manager.
//!
//! Control frames ride the encrypted transport like any other message and
//! carry CBOR-encoded relay negotiation: a peer asks us to accept a relayed
//! tunnel leg, or confirms one we asked for. The dispatcher decrypts and
//! decodes, then hands the message here.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::crypto::NONCE_LEN;
use crate::header::{MsgType, SUBTYPE_NONE};
use crate::hostmap::{HostInfo, Relay, RelayState, RelayType};
use crate::interface::Interface;

/// What a control frame is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMsgType {
    /// Sender wants us to terminate a relayed tunnel from `relay_from_ip`.
    CreateRelayRequest,
    /// Sender accepted our relay leg and tells us its index for it.
    CreateRelayResponse,
}

/// CBOR payload of a `Control` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMsg {
    pub msg_type: ControlMsgType,
    /// The requester's index for the relay leg.
    pub initiator_relay_index: u32,
    /// The responder's index, meaningful on responses.
    pub responder_relay_index: u32,
    /// Overlay address of the tunnel originator.
    pub relay_from_ip: Ipv4Addr,
    /// Overlay address of the tunnel target.
    pub relay_to_ip: Ipv4Addr,
}

pub fn encode_control(msg: &ControlMsg) -> Result<Vec<u8>> {
    serde_cbor::to_vec(msg).context("Failed to encode control message")
}

pub fn parse_control(data: &[u8]) -> Result<ControlMsg> {
    serde_cbor::from_slice(data).context("Failed to decode control message")
}

/// Maintains relay legs in response to control traffic.
#[derive(Default)]
pub struct RelayManager;

impl RelayManager {
    pub fn new() -> Self {
        Self
    }

    /// Apply a decrypted control message from `hostinfo`'s session.
    pub fn handle_control_msg(&self, hostinfo: &Arc<HostInfo>, msg: &ControlMsg, iface: &Interface) {
        match msg.msg_type {
            ControlMsgType::CreateRelayRequest => self.handle_request(hostinfo, msg, iface),
            ControlMsgType::CreateRelayResponse => self.handle_response(hostinfo, msg),
        }
    }

    fn handle_request(&self, hostinfo: &Arc<HostInfo>, msg: &ControlMsg, iface: &Interface) {
        // We terminate this leg: the far end of the relayed tunnel is the
        // originator, the direct peer is the relay itself.
        let local_index: u32 = rand::random();
        let relay = Relay {
            relay_type: RelayType::Terminal,
            state: RelayState::Established,
            peer_ip: msg.relay_from_ip,
            local_index,
            remote_index: msg.initiator_relay_index,
        };
        hostinfo.relay_state.insert(relay);
        iface.hostmap.add_relay_index(local_index, hostinfo.clone());

        info!(
            "Relay leg established: {} -> {} via {} (index {})",
            msg.relay_from_ip, msg.relay_to_ip, hostinfo.vpn_ip, local_index
        );

        let reply = ControlMsg {
            msg_type: ControlMsgType::CreateRelayResponse,
            initiator_relay_index: msg.initiator_relay_index,
            responder_relay_index: local_index,
            relay_from_ip: msg.relay_from_ip,
            relay_to_ip: msg.relay_to_ip,
        };
        match encode_control(&reply) {
            Ok(payload) => {
                let mut nb = [0u8; NONCE_LEN];
                let mut out = Vec::new();
                iface.send(MsgType::Control, SUBTYPE_NONE, hostinfo, &payload, &mut nb, &mut out);
            }
            Err(e) => info!("Dropping relay response: {}", e),
        }
    }

    fn handle_response(&self, hostinfo: &Arc<HostInfo>, msg: &ControlMsg) {
        if hostinfo
            .relay_state
            .establish(msg.initiator_relay_index, msg.responder_relay_index)
        {
            info!(
                "Relay leg to {} confirmed by {} (index {} -> {})",
                msg.relay_to_ip, hostinfo.vpn_ip, msg.initiator_relay_index,
                msg.responder_relay_index
            );
        } else {
            info!(
                "Control response for unknown relay index {} from {}",
                msg.initiator_relay_index, hostinfo.vpn_ip
            );
        }
    }
}
