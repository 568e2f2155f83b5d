//! End-to-end exercises of the inbound packet path with in-memory transport.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canopy::conn_manager::ConnectionManager;
use canopy::control::{encode_control, parse_control, ControlMsg, ControlMsgType, RelayManager};
use canopy::crypto::{SessionCipher, NONCE_LEN};
use canopy::firewall::{AllowAll, ConntrackCache, DropReason, Firewall, Packet, PROTO_UDP};
use canopy::handshake::HandshakeManager;
use canopy::header::{
    Header, MsgType, HEADER_LEN, SUBTYPE_NONE, SUBTYPE_RELAY, TEST_REPLY, TEST_REQUEST,
};
use canopy::hostmap::{ConnectionState, HostInfo, Hostmap, Relay, RelayState, RelayType};
use canopy::interface::{
    Interface, InterfaceDeps, MemoryInside, MemoryOutside, WorkerScratch,
};
use canopy::lighthouse::{AllowRule, Lighthouse, RemoteAllowList};
use canopy::metrics::Metrics;
use canopy::ratelimit::RecvErrorConfig;

const MY_VPN_IP: &str = "10.128.0.1";

struct TestNet {
    iface: Interface,
    outside: Arc<MemoryOutside>,
    inside: Arc<MemoryInside>,
    lighthouse_calls: Arc<Mutex<Vec<(Ipv4Addr, Vec<u8>)>>>,
    handshake_calls: Arc<Mutex<Vec<u32>>>,
}

fn build_net(allow_rules: Vec<AllowRule>, firewall: Arc<dyn Firewall>) -> TestNet {
    let outside = Arc::new(MemoryOutside::default());
    let inside = Arc::new(MemoryInside::default());
    let lighthouse_calls = Arc::new(Mutex::new(Vec::new()));
    let handshake_calls = Arc::new(Mutex::new(Vec::new()));

    let lh_calls = lighthouse_calls.clone();
    let hs_calls = handshake_calls.clone();

    let iface = Interface::new(InterfaceDeps {
        hostmap: Arc::new(Hostmap::new()),
        handshake_manager: Arc::new(HandshakeManager::new()),
        lighthouse: Arc::new(Lighthouse::new(
            MY_VPN_IP.parse().unwrap(),
            24,
            RemoteAllowList::new(allow_rules),
        )),
        conn_manager: Arc::new(ConnectionManager::new()),
        relay_manager: Arc::new(RelayManager::new()),
        firewall,
        metrics: Metrics::new(),
        outside: outside.clone(),
        inside: inside.clone(),
        lighthouse_callback: Box::new(move |_addr, vpn_ip, plaintext, _iface| {
            lh_calls.lock().unwrap().push((vpn_ip, plaintext.to_vec()));
        }),
        handshake_callback: Box::new(move |_iface, _addr, _via, _packet, h, _hostinfo| {
            hs_calls.lock().unwrap().push(h.remote_index);
        }),
        recv_error: RecvErrorConfig::default(),
        roaming_suppress: Duration::from_secs(2),
    });

    TestNet {
        iface,
        outside,
        inside,
        lighthouse_calls,
        handshake_calls,
    }
}

fn net() -> TestNet {
    build_net(Vec::new(), Arc::new(AllowAll))
}

fn add_host(
    net: &TestNet,
    vpn_ip: &str,
    local_index: u32,
    remote_index: u32,
    remote: &str,
    key: [u8; 32],
) -> Arc<HostInfo> {
    let host = Arc::new(HostInfo::new(
        vpn_ip.parse().unwrap(),
        local_index,
        remote_index,
        Some(remote.parse().unwrap()),
        Some(ConnectionState::new(&key, &key)),
    ));
    net.iface.hostmap.add(host.clone());
    host
}

/// Encrypt a frame the way the peer's outbound path would.
fn encrypted_frame(
    t: MsgType,
    subtype: u8,
    idx: u32,
    counter: u64,
    key: &[u8; 32],
    plaintext: &[u8],
) -> Vec<u8> {
    let header = Header::new(t, subtype, idx, counter);
    let mut ad = [0u8; HEADER_LEN];
    header.encode(&mut ad).unwrap();

    let mut wire = ad.to_vec();
    let mut nb = [0u8; NONCE_LEN];
    SessionCipher::new(key)
        .encrypt(&mut wire, &ad, plaintext, counter, &mut nb)
        .unwrap();
    wire
}

/// Authenticate-but-don't-encrypt wrapping of an inner frame.
fn relay_frame(idx: u32, counter: u64, key: &[u8; 32], inner: &[u8]) -> Vec<u8> {
    let header = Header::new(MsgType::Message, SUBTYPE_RELAY, idx, counter);
    let mut wire = header.to_bytes();
    wire.extend_from_slice(inner);

    let mut nb = [0u8; NONCE_LEN];
    let tag = SessionCipher::new(key)
        .tag_detached(&wire, counter, &mut nb)
        .unwrap();
    wire.extend_from_slice(&tag);
    wire
}

fn ipv4_udp(src: &str, dst: &str, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let src: Ipv4Addr = src.parse().unwrap();
    let dst: Ipv4Addr = dst.parse().unwrap();
    let mut p = vec![0u8; 28 + payload.len()];
    p[0] = 0x45;
    p[9] = PROTO_UDP;
    p[12..16].copy_from_slice(&src.octets());
    p[16..20].copy_from_slice(&dst.octets());
    p[20..22].copy_from_slice(&sport.to_be_bytes());
    p[22..24].copy_from_slice(&dport.to_be_bytes());
    p[28..].copy_from_slice(payload);
    p
}

fn dispatch(net: &TestNet, addr: &str, packet: &[u8]) {
    let mut scratch = WorkerScratch::new(0);
    let addr: SocketAddr = addr.parse().unwrap();
    net.iface
        .read_outside_packets(Some(addr), None, packet, &mut scratch);
}

#[test]
fn normal_datagram_reaches_tun() {
    let net = net();
    let key = [7u8; 32];
    add_host(&net, "10.128.0.2", 42, 99, "203.0.113.9:4242", key);

    let inner = ipv4_udp("10.0.0.2", "10.0.0.1", 5000, 53, b"dns query");
    let wire = encrypted_frame(MsgType::Message, SUBTYPE_NONE, 42, 1, &key, &inner);
    dispatch(&net, "203.0.113.9:4242", &wire);

    let written = net.inside.written.lock().unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0], inner);
}

#[test]
fn replayed_datagram_is_dropped() {
    let net = net();
    let key = [7u8; 32];
    let host = add_host(&net, "10.128.0.2", 42, 99, "203.0.113.9:4242", key);

    let inner = ipv4_udp("10.0.0.2", "10.0.0.1", 5000, 53, b"x");
    let wire = encrypted_frame(MsgType::Message, SUBTYPE_NONE, 42, 1, &key, &inner);

    dispatch(&net, "203.0.113.9:4242", &wire);
    dispatch(&net, "203.0.113.9:4242", &wire);

    assert_eq!(net.inside.written.lock().unwrap().len(), 1);
    // Window still has exactly counter 1 committed.
    let cs = host.connection_state.as_ref().unwrap();
    assert!(!cs.window_check(1));
    assert!(cs.window_check(2));
}

#[test]
fn tampered_header_fails_aead_without_recv_error() {
    let net = net();
    let key = [7u8; 32];
    add_host(&net, "10.128.0.2", 42, 99, "203.0.113.9:4242", key);

    let inner = ipv4_udp("10.0.0.2", "10.0.0.1", 5000, 53, b"x");
    let mut wire = encrypted_frame(MsgType::Message, SUBTYPE_NONE, 42, 1, &key, &inner);
    // Flip a reserved header byte: routing is unchanged but the associated
    // data no longer matches.
    wire[2] ^= 0x01;
    dispatch(&net, "203.0.113.9:4242", &wire);

    assert!(net.inside.written.lock().unwrap().is_empty());
    assert!(net.outside.sent.lock().unwrap().is_empty());
    assert_eq!(
        net.iface
            .metrics
            .drop_decrypt
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn unknown_index_answers_with_recv_error() {
    let net = net();
    let key = [7u8; 32];
    let inner = ipv4_udp("10.0.0.2", "10.0.0.1", 5000, 53, b"x");
    let wire = encrypted_frame(MsgType::Message, SUBTYPE_NONE, 7777, 1, &key, &inner);
    dispatch(&net, "203.0.113.9:4242", &wire);

    let sent = net.outside.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (reply, to) = &sent[0];
    assert_eq!(to, &"203.0.113.9:4242".parse::<SocketAddr>().unwrap());
    assert_eq!(reply.len(), HEADER_LEN);

    let h = Header::parse(reply).unwrap();
    assert_eq!(h.msg_type, MsgType::RecvError);
    assert_eq!(h.remote_index, 7777);
    assert!(net.inside.written.lock().unwrap().is_empty());
}

#[test]
fn short_datagrams_are_silently_ignored() {
    let net = net();
    dispatch(&net, "203.0.113.9:4242", &[]);
    dispatch(&net, "203.0.113.9:4242", &[0x42]);
    dispatch(&net, "203.0.113.9:4242", &[0u8; 7]);

    assert!(net.outside.sent.lock().unwrap().is_empty());
    assert!(net.inside.written.lock().unwrap().is_empty());
}

#[test]
fn own_subnet_source_is_dropped_before_lookup() {
    let net = net();
    let key = [7u8; 32];
    let inner = ipv4_udp("10.0.0.2", "10.0.0.1", 5000, 53, b"x");
    // Unknown index would normally earn a recv-error, but the source address
    // sits inside our own overlay subnet.
    let wire = encrypted_frame(MsgType::Message, SUBTYPE_NONE, 7777, 1, &key, &inner);
    dispatch(&net, "10.128.0.77:4242", &wire);

    assert!(net.outside.sent.lock().unwrap().is_empty());
    assert!(net.inside.written.lock().unwrap().is_empty());
}

#[test]
fn test_request_roams_then_echoes() {
    let net = net();
    let key = [3u8; 32];
    let host = add_host(&net, "10.128.0.2", 42, 99, "203.0.113.9:4242", key);

    let wire = encrypted_frame(MsgType::Test, TEST_REQUEST, 42, 1, &key, b"probe payload");
    // The probe arrives from a new endpoint.
    dispatch(&net, "198.51.100.4:9999", &wire);

    let new_remote: SocketAddr = "198.51.100.4:9999".parse().unwrap();
    assert_eq!(host.remote(), Some(new_remote));

    let sent = net.outside.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (reply, to) = &sent[0];
    // Reply goes to the roamed endpoint and echoes the payload.
    assert_eq!(to, &new_remote);
    let h = Header::parse(reply).unwrap();
    assert_eq!(h.msg_type, MsgType::Test);
    assert_eq!(h.subtype, TEST_REPLY);
    assert_eq!(h.remote_index, 99);

    let mut out = Vec::new();
    let mut nb = [0u8; NONCE_LEN];
    let plain = SessionCipher::new(&key)
        .decrypt(
            &mut out,
            &reply[..HEADER_LEN],
            &reply[HEADER_LEN..],
            h.message_counter,
            &mut nb,
        )
        .unwrap();
    assert_eq!(plain, b"probe payload");
}

#[test]
fn test_reply_is_consumed_quietly() {
    let net = net();
    let key = [3u8; 32];
    add_host(&net, "10.128.0.2", 42, 99, "203.0.113.9:4242", key);

    let wire = encrypted_frame(MsgType::Test, TEST_REPLY, 42, 1, &key, b"pong");
    dispatch(&net, "203.0.113.9:4242", &wire);

    assert!(net.outside.sent.lock().unwrap().is_empty());
    assert!(net.inside.written.lock().unwrap().is_empty());
}

#[test]
fn roaming_applies_allow_list_and_suppression() {
    // Deny roams into 192.0.2.0/24.
    let net = build_net(
        vec![AllowRule {
            net: "192.0.2.0".parse().unwrap(),
            bits: 24,
            allow: false,
        }],
        Arc::new(AllowAll),
    );
    let key = [5u8; 32];
    let host = add_host(&net, "10.128.0.2", 42, 99, "203.0.113.9:4242", key);
    let x: SocketAddr = "203.0.113.9:4242".parse().unwrap();
    let y: SocketAddr = "198.51.100.4:9999".parse().unwrap();

    let inner = ipv4_udp("10.0.0.2", "10.0.0.1", 5000, 53, b"x");

    // Denied endpoint: authenticated fine, but no roam.
    let wire = encrypted_frame(MsgType::Message, SUBTYPE_NONE, 42, 1, &key, &inner);
    dispatch(&net, "192.0.2.8:4242", &wire);
    assert_eq!(host.remote(), Some(x));

    // Allowed endpoint: roam to Y.
    let wire = encrypted_frame(MsgType::Message, SUBTYPE_NONE, 42, 2, &key, &inner);
    dispatch(&net, "198.51.100.4:9999", &wire);
    assert_eq!(host.remote(), Some(y));

    // Straight bounce back to X inside the suppression window: stays on Y.
    let wire = encrypted_frame(MsgType::Message, SUBTYPE_NONE, 42, 3, &key, &inner);
    dispatch(&net, "203.0.113.9:4242", &wire);
    assert_eq!(host.remote(), Some(y));
}

#[test]
fn relay_terminal_delivers_inner_packet_once() {
    let net = net();
    let relay_key = [11u8; 32];
    let peer_key = [22u8; 32];

    // Session with the relay host R; it owns the terminal relay entry for
    // the tunnel originator A.
    let relay_host = add_host(&net, "10.128.0.50", 500, 600, "203.0.113.50:4242", relay_key);
    relay_host.relay_state.insert(Relay {
        relay_type: RelayType::Terminal,
        state: RelayState::Established,
        peer_ip: "10.128.0.2".parse().unwrap(),
        local_index: 9000,
        remote_index: 9500,
    });
    net.iface.hostmap.add_relay_index(9000, relay_host.clone());

    // Direct (relayed) session with the originator A.
    add_host(&net, "10.128.0.2", 42, 99, "203.0.113.9:4242", peer_key);

    let inner_ip = ipv4_udp("10.0.0.2", "10.0.0.1", 5000, 53, b"relayed");
    let inner = encrypted_frame(MsgType::Message, SUBTYPE_NONE, 42, 1, &peer_key, &inner_ip);
    let outer = relay_frame(9000, 1, &relay_key, &inner);

    dispatch(&net, "203.0.113.50:4242", &outer);

    let written = net.inside.written.lock().unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0], inner_ip);
}

#[test]
fn relay_frame_with_bad_tag_is_dropped() {
    let net = net();
    let relay_key = [11u8; 32];
    let relay_host = add_host(&net, "10.128.0.50", 500, 600, "203.0.113.50:4242", relay_key);
    relay_host.relay_state.insert(Relay {
        relay_type: RelayType::Terminal,
        state: RelayState::Established,
        peer_ip: "10.128.0.2".parse().unwrap(),
        local_index: 9000,
        remote_index: 9500,
    });
    net.iface.hostmap.add_relay_index(9000, relay_host);

    let mut outer = relay_frame(9000, 1, &relay_key, b"some wrapped bytes");
    let last = outer.len() - 1;
    outer[last] ^= 0xff;
    dispatch(&net, "203.0.113.50:4242", &outer);

    assert!(net.inside.written.lock().unwrap().is_empty());
    assert!(net.outside.sent.lock().unwrap().is_empty());
}

#[test]
fn nested_relay_frame_is_dropped() {
    let net = net();
    let relay_key = [11u8; 32];
    let relay_host = add_host(&net, "10.128.0.50", 500, 600, "203.0.113.50:4242", relay_key);
    relay_host.relay_state.insert(Relay {
        relay_type: RelayType::Terminal,
        state: RelayState::Established,
        peer_ip: "10.128.0.2".parse().unwrap(),
        local_index: 9000,
        remote_index: 9500,
    });
    net.iface.hostmap.add_relay_index(9000, relay_host);

    // A relay frame wrapped inside a relay frame: one peel is the limit.
    let inner = relay_frame(9000, 2, &relay_key, b"deeper");
    let outer = relay_frame(9000, 1, &relay_key, &inner);
    dispatch(&net, "203.0.113.50:4242", &outer);

    assert!(net.inside.written.lock().unwrap().is_empty());
    assert_eq!(
        net.iface
            .metrics
            .drop_relay
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn relay_forwarding_rewraps_for_target() {
    let net = net();
    let a_key = [11u8; 32];
    let b_key = [22u8; 32];

    // We are the relay: A's session carries a forwarding entry toward B,
    // B's session carries the established reverse entry toward A.
    let host_a = add_host(&net, "10.128.0.2", 100, 110, "203.0.113.9:4242", a_key);
    host_a.relay_state.insert(Relay {
        relay_type: RelayType::Forwarding,
        state: RelayState::Established,
        peer_ip: "10.128.0.3".parse().unwrap(),
        local_index: 9000,
        remote_index: 9100,
    });
    net.iface.hostmap.add_relay_index(9000, host_a.clone());

    let host_b = add_host(&net, "10.128.0.3", 200, 210, "198.51.100.7:4242", b_key);
    host_b.relay_state.insert(Relay {
        relay_type: RelayType::Forwarding,
        state: RelayState::Established,
        peer_ip: "10.128.0.2".parse().unwrap(),
        local_index: 9200,
        remote_index: 9300,
    });

    let wrapped = b"opaque inner frame for B";
    let outer = relay_frame(9000, 1, &a_key, wrapped);
    dispatch(&net, "203.0.113.9:4242", &outer);

    // Nothing lands locally; the frame goes back out toward B.
    assert!(net.inside.written.lock().unwrap().is_empty());
    let sent = net.outside.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (fwd, to) = &sent[0];
    assert_eq!(to, &"198.51.100.7:4242".parse::<SocketAddr>().unwrap());

    let h = Header::parse(fwd).unwrap();
    assert_eq!(h.msg_type, MsgType::Message);
    assert_eq!(h.subtype, SUBTYPE_RELAY);
    // Addressed with B's index for its relay leg.
    assert_eq!(h.remote_index, 9300);

    // B can authenticate the forwarded frame and recover the payload.
    let tag_start = fwd.len() - 16;
    let mut nb = [0u8; NONCE_LEN];
    SessionCipher::new(&b_key)
        .verify_detached(&fwd[..tag_start], &fwd[tag_start..], h.message_counter, &mut nb)
        .unwrap();
    assert_eq!(&fwd[HEADER_LEN..tag_start], wrapped);
}

#[test]
fn relay_forwarding_drops_on_pending_target() {
    let net = net();
    let a_key = [11u8; 32];
    let b_key = [22u8; 32];

    let host_a = add_host(&net, "10.128.0.2", 100, 110, "203.0.113.9:4242", a_key);
    host_a.relay_state.insert(Relay {
        relay_type: RelayType::Forwarding,
        state: RelayState::Established,
        peer_ip: "10.128.0.3".parse().unwrap(),
        local_index: 9000,
        remote_index: 9100,
    });
    net.iface.hostmap.add_relay_index(9000, host_a);

    let host_b = add_host(&net, "10.128.0.3", 200, 210, "198.51.100.7:4242", b_key);
    host_b.relay_state.insert(Relay {
        relay_type: RelayType::Forwarding,
        state: RelayState::PendingHandshake,
        peer_ip: "10.128.0.2".parse().unwrap(),
        local_index: 9200,
        remote_index: 9300,
    });

    let outer = relay_frame(9000, 1, &a_key, b"wrapped");
    dispatch(&net, "203.0.113.9:4242", &outer);

    assert!(net.outside.sent.lock().unwrap().is_empty());
    assert_eq!(
        net.iface
            .metrics
            .drop_relay
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn recv_error_needs_threshold_and_matching_endpoint() {
    let net = net();
    let key = [9u8; 32];
    add_host(&net, "10.128.0.2", 42, 99, "203.0.113.9:4242", key);

    let tombstone = Header::new(MsgType::RecvError, SUBTYPE_NONE, 99, 0).to_bytes();

    // Below the threshold nothing happens.
    for _ in 0..3 {
        dispatch(&net, "203.0.113.9:4242", &tombstone);
        assert!(net.iface.hostmap.query_index(42).is_some());
    }

    // Over the threshold but from the wrong endpoint: spoof, ignored.
    dispatch(&net, "198.51.100.66:4242", &tombstone);
    assert!(net.iface.hostmap.query_index(42).is_some());

    // From the real endpoint: teardown.
    dispatch(&net, "203.0.113.9:4242", &tombstone);
    assert!(net.iface.hostmap.query_index(42).is_none());
}

#[test]
fn close_tunnel_tears_down_and_purges_lighthouse() {
    let net = net();
    let key = [9u8; 32];
    let vpn: Ipv4Addr = "10.128.0.2".parse().unwrap();
    add_host(&net, "10.128.0.2", 42, 99, "203.0.113.9:4242", key);
    net.iface
        .lighthouse
        .learn(vpn, "203.0.113.9:4242".parse().unwrap());

    let wire = encrypted_frame(MsgType::CloseTunnel, SUBTYPE_NONE, 42, 1, &key, &[]);
    dispatch(&net, "203.0.113.9:4242", &wire);

    assert!(net.iface.hostmap.query_index(42).is_none());
    assert!(net.iface.lighthouse.learned(vpn).is_empty());
}

#[test]
fn lighthouse_payload_reaches_callback() {
    let net = net();
    let key = [4u8; 32];
    add_host(&net, "10.128.0.2", 42, 99, "203.0.113.9:4242", key);

    let wire = encrypted_frame(MsgType::LightHouse, SUBTYPE_NONE, 42, 1, &key, b"discovery");
    dispatch(&net, "203.0.113.9:4242", &wire);

    let calls = net.lighthouse_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "10.128.0.2".parse::<Ipv4Addr>().unwrap());
    assert_eq!(calls[0].1, b"discovery");
}

#[test]
fn handshake_reaches_callback_without_session() {
    let net = net();
    let wire = Header::new(MsgType::Handshake, SUBTYPE_NONE, 1234, 0).to_bytes();
    dispatch(&net, "203.0.113.9:4242", &wire);

    assert_eq!(*net.handshake_calls.lock().unwrap(), vec![1234]);
    // No recv-error for handshakes.
    assert!(net.outside.sent.lock().unwrap().is_empty());
}

#[test]
fn unknown_type_is_counted_and_dropped() {
    let net = net();
    let wire = Header::new(MsgType::Unknown(9), 0, 1, 0).to_bytes();
    dispatch(&net, "203.0.113.9:4242", &wire);

    assert_eq!(
        net.iface
            .metrics
            .rx_unknown
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    assert!(net.outside.sent.lock().unwrap().is_empty());
}

#[test]
fn control_request_builds_relay_leg_and_responds() {
    let net = net();
    let key = [6u8; 32];
    let relay_peer = add_host(&net, "10.128.0.50", 500, 600, "203.0.113.50:4242", key);

    let msg = ControlMsg {
        msg_type: ControlMsgType::CreateRelayRequest,
        initiator_relay_index: 7100,
        responder_relay_index: 0,
        relay_from_ip: "10.128.0.2".parse().unwrap(),
        relay_to_ip: MY_VPN_IP.parse().unwrap(),
    };
    let wire = encrypted_frame(
        MsgType::Control,
        SUBTYPE_NONE,
        500,
        1,
        &key,
        &encode_control(&msg).unwrap(),
    );
    dispatch(&net, "203.0.113.50:4242", &wire);

    // A terminal leg toward the originator now exists on the relay session.
    let relay = relay_peer
        .relay_state
        .query_by_peer_ip("10.128.0.2".parse().unwrap())
        .expect("relay leg created");
    assert_eq!(relay.relay_type, RelayType::Terminal);
    assert_eq!(relay.state, RelayState::Established);
    assert_eq!(relay.remote_index, 7100);
    assert!(net
        .iface
        .hostmap
        .query_relay_index(relay.local_index)
        .is_some());

    // And the response went back, naming our index for the leg.
    let sent = net.outside.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (reply, _) = &sent[0];
    let h = Header::parse(reply).unwrap();
    assert_eq!(h.msg_type, MsgType::Control);

    let mut out = Vec::new();
    let mut nb = [0u8; NONCE_LEN];
    let plain = SessionCipher::new(&key)
        .decrypt(
            &mut out,
            &reply[..HEADER_LEN],
            &reply[HEADER_LEN..],
            h.message_counter,
            &mut nb,
        )
        .unwrap();
    let response = parse_control(plain).unwrap();
    assert_eq!(response.msg_type, ControlMsgType::CreateRelayResponse);
    assert_eq!(response.initiator_relay_index, 7100);
    assert_eq!(response.responder_relay_index, relay.local_index);
}

#[test]
fn control_response_establishes_pending_leg() {
    let net = net();
    let key = [6u8; 32];
    let relay_peer = add_host(&net, "10.128.0.50", 500, 600, "203.0.113.50:4242", key);
    relay_peer.relay_state.insert(Relay {
        relay_type: RelayType::Terminal,
        state: RelayState::PendingHandshake,
        peer_ip: "10.128.0.2".parse().unwrap(),
        local_index: 7100,
        remote_index: 0,
    });

    let msg = ControlMsg {
        msg_type: ControlMsgType::CreateRelayResponse,
        initiator_relay_index: 7100,
        responder_relay_index: 8200,
        relay_from_ip: "10.128.0.2".parse().unwrap(),
        relay_to_ip: "10.128.0.3".parse().unwrap(),
    };
    let wire = encrypted_frame(
        MsgType::Control,
        SUBTYPE_NONE,
        500,
        1,
        &key,
        &encode_control(&msg).unwrap(),
    );
    dispatch(&net, "203.0.113.50:4242", &wire);

    let relay = relay_peer.relay_state.query_by_local_index(7100).unwrap();
    assert_eq!(relay.state, RelayState::Established);
    assert_eq!(relay.remote_index, 8200);
}

struct DenyAll;

impl Firewall for DenyAll {
    fn drop_inbound(
        &self,
        _data: &[u8],
        _fp: &Packet,
        _host: &HostInfo,
        _cache: &mut ConntrackCache,
    ) -> Option<DropReason> {
        Some(DropReason::NoMatchingRule)
    }
}

#[test]
fn firewall_drop_keeps_packet_off_tun() {
    let net = build_net(Vec::new(), Arc::new(DenyAll));
    let key = [7u8; 32];
    add_host(&net, "10.128.0.2", 42, 99, "203.0.113.9:4242", key);

    let inner = ipv4_udp("10.0.0.2", "10.0.0.1", 5000, 53, b"x");
    let wire = encrypted_frame(MsgType::Message, SUBTYPE_NONE, 42, 1, &key, &inner);
    dispatch(&net, "203.0.113.9:4242", &wire);

    assert!(net.inside.written.lock().unwrap().is_empty());
    assert_eq!(
        net.iface
            .metrics
            .drop_firewall
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}
