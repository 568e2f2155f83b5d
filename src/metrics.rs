use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::header::MsgType;

/// Prometheus-compatible counters for the packet path.
pub struct Metrics {
    pub rx_message: AtomicU64,
    pub rx_lighthouse: AtomicU64,
    pub rx_test: AtomicU64,
    pub rx_handshake: AtomicU64,
    pub rx_recv_error: AtomicU64,
    pub rx_close_tunnel: AtomicU64,
    pub rx_control: AtomicU64,
    pub rx_unknown: AtomicU64,
    pub tx_message: AtomicU64,
    pub tx_lighthouse: AtomicU64,
    pub tx_test: AtomicU64,
    pub tx_handshake: AtomicU64,
    pub tx_recv_error: AtomicU64,
    pub tx_close_tunnel: AtomicU64,
    pub tx_control: AtomicU64,
    pub tx_unknown: AtomicU64,
    pub drop_replay: AtomicU64,
    pub drop_decrypt: AtomicU64,
    pub drop_firewall: AtomicU64,
    pub drop_relay: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rx_message: AtomicU64::new(0),
            rx_lighthouse: AtomicU64::new(0),
            rx_test: AtomicU64::new(0),
            rx_handshake: AtomicU64::new(0),
            rx_recv_error: AtomicU64::new(0),
            rx_close_tunnel: AtomicU64::new(0),
            rx_control: AtomicU64::new(0),
            rx_unknown: AtomicU64::new(0),
            tx_message: AtomicU64::new(0),
            tx_lighthouse: AtomicU64::new(0),
            tx_test: AtomicU64::new(0),
            tx_handshake: AtomicU64::new(0),
            tx_recv_error: AtomicU64::new(0),
            tx_close_tunnel: AtomicU64::new(0),
            tx_control: AtomicU64::new(0),
            tx_unknown: AtomicU64::new(0),
            drop_replay: AtomicU64::new(0),
            drop_decrypt: AtomicU64::new(0),
            drop_firewall: AtomicU64::new(0),
            drop_relay: AtomicU64::new(0),
        })
    }

    pub fn rx(&self, t: MsgType) {
        let counter = match t {
            MsgType::Message => &self.rx_message,
            MsgType::LightHouse => &self.rx_lighthouse,
            MsgType::Test => &self.rx_test,
            MsgType::Handshake => &self.rx_handshake,
            MsgType::RecvError => &self.rx_recv_error,
            MsgType::CloseTunnel => &self.rx_close_tunnel,
            MsgType::Control => &self.rx_control,
            MsgType::Unknown(_) => &self.rx_unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tx(&self, t: MsgType) {
        let counter = match t {
            MsgType::Message => &self.tx_message,
            MsgType::LightHouse => &self.tx_lighthouse,
            MsgType::Test => &self.tx_test,
            MsgType::Handshake => &self.tx_handshake,
            MsgType::RecvError => &self.tx_recv_error,
            MsgType::CloseTunnel => &self.tx_close_tunnel,
            MsgType::Control => &self.tx_control,
            MsgType::Unknown(_) => &self.tx_unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_drop_replay(&self) {
        self.drop_replay.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_drop_decrypt(&self) {
        self.drop_decrypt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_drop_firewall(&self) {
        self.drop_firewall.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_drop_relay(&self) {
        self.drop_relay.fetch_add(1, Ordering::Relaxed);
    }

    /// Format counters in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let pairs = [
            ("canopy_rx_message_total", &self.rx_message),
            ("canopy_rx_lighthouse_total", &self.rx_lighthouse),
            ("canopy_rx_test_total", &self.rx_test),
            ("canopy_rx_handshake_total", &self.rx_handshake),
            ("canopy_rx_recv_error_total", &self.rx_recv_error),
            ("canopy_rx_close_tunnel_total", &self.rx_close_tunnel),
            ("canopy_rx_control_total", &self.rx_control),
            ("canopy_rx_unknown_total", &self.rx_unknown),
            ("canopy_tx_message_total", &self.tx_message),
            ("canopy_tx_lighthouse_total", &self.tx_lighthouse),
            ("canopy_tx_test_total", &self.tx_test),
            ("canopy_tx_handshake_total", &self.tx_handshake),
            ("canopy_tx_recv_error_total", &self.tx_recv_error),
            ("canopy_tx_close_tunnel_total", &self.tx_close_tunnel),
            ("canopy_tx_control_total", &self.tx_control),
            ("canopy_tx_unknown_total", &self.tx_unknown),
            ("canopy_drop_replay_total", &self.drop_replay),
            ("canopy_drop_decrypt_total", &self.drop_decrypt),
            ("canopy_drop_firewall_total", &self.drop_firewall),
            ("canopy_drop_relay_total", &self.drop_relay),
        ];

        let mut out = String::new();
        for (name, counter) in pairs {
            out.push_str(&format!(
                "# TYPE {} counter\n{} {}\n",
                name,
                name,
                counter.load(Ordering::Relaxed)
            ));
        }
        out
    }
}
