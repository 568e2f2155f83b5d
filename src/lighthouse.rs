//! Lighthouse state consulted by the inbound path.
//!
//! The discovery protocol itself is handled elsewhere and delivered to the
//! dispatcher as a callback; this module owns what the packet path needs
//! from it: our own overlay subnet (anti-loop check), the remote allow list
//! gating roams, and the learned-endpoint cache purged on final teardown.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;

use log::debug;

/// One prefix rule of the allow list.
#[derive(Debug, Clone, Copy)]
pub struct AllowRule {
    pub net: Ipv4Addr,
    pub bits: u8,
    pub allow: bool,
}

impl AllowRule {
    fn mask(&self) -> u32 {
        if self.bits == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.bits))
        }
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & self.mask()) == (u32::from(self.net) & self.mask())
    }
}

/// Prefix rules deciding which physical addresses a peer may roam to.
/// Most specific matching prefix wins; the default is allow.
#[derive(Default)]
pub struct RemoteAllowList {
    rules: Vec<AllowRule>,
    /// Overrides for specific overlay addresses.
    host_rules: HashMap<Ipv4Addr, Vec<AllowRule>>,
}

impl RemoteAllowList {
    pub fn new(rules: Vec<AllowRule>) -> Self {
        Self {
            rules,
            host_rules: HashMap::new(),
        }
    }

    pub fn add_host_rules(&mut self, vpn_ip: Ipv4Addr, rules: Vec<AllowRule>) {
        self.host_rules.insert(vpn_ip, rules);
    }

    fn decide(rules: &[AllowRule], ip: Ipv4Addr) -> Option<bool> {
        rules
            .iter()
            .filter(|r| r.contains(ip))
            .max_by_key(|r| r.bits)
            .map(|r| r.allow)
    }

    /// May `vpn_ip` use physical address `ip`? Non-IPv4 addresses are
    /// accepted without check.
    pub fn allow(&self, vpn_ip: Ipv4Addr, ip: IpAddr) -> bool {
        let IpAddr::V4(ip4) = ip else {
            return true;
        };
        if let Some(rules) = self.host_rules.get(&vpn_ip) {
            if let Some(verdict) = Self::decide(rules, ip4) {
                return verdict;
            }
        }
        Self::decide(&self.rules, ip4).unwrap_or(true)
    }
}

/// Lighthouse-side state the inbound path reads and trims.
pub struct Lighthouse {
    my_vpn_ip: Ipv4Addr,
    my_vpn_mask_bits: u8,
    allow_list: RemoteAllowList,
    /// Endpoints learned from lighthouse replies, keyed by overlay address.
    learned: Mutex<HashMap<Ipv4Addr, Vec<SocketAddr>>>,
}

impl Lighthouse {
    pub fn new(my_vpn_ip: Ipv4Addr, my_vpn_mask_bits: u8, allow_list: RemoteAllowList) -> Self {
        Self {
            my_vpn_ip,
            my_vpn_mask_bits,
            allow_list,
            learned: Mutex::new(HashMap::new()),
        }
    }

    pub fn my_vpn_ip(&self) -> Ipv4Addr {
        self.my_vpn_ip
    }

    /// True when `ip` falls inside our own overlay subnet. A physical source
    /// address in the overlay range means the datagram looped back through
    /// the mesh already encrypted once.
    pub fn my_subnet_contains(&self, ip: Ipv4Addr) -> bool {
        let mask = if self.my_vpn_mask_bits == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.my_vpn_mask_bits))
        };
        (u32::from(ip) & mask) == (u32::from(self.my_vpn_ip) & mask)
    }

    pub fn remote_allow_list(&self) -> &RemoteAllowList {
        &self.allow_list
    }

    pub fn learn(&self, vpn_ip: Ipv4Addr, addr: SocketAddr) {
        let mut learned = self.learned.lock().unwrap();
        let endpoints = learned.entry(vpn_ip).or_default();
        if !endpoints.contains(&addr) {
            endpoints.push(addr);
        }
    }

    pub fn learned(&self, vpn_ip: Ipv4Addr) -> Vec<SocketAddr> {
        self.learned
            .lock()
            .unwrap()
            .get(&vpn_ip)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget everything learned about `vpn_ip`. Called when the last tunnel
    /// for that address goes away.
    pub fn delete_vpn_ip(&self, vpn_ip: Ipv4Addr) {
        if self.learned.lock().unwrap().remove(&vpn_ip).is_some() {
            debug!("Cleared learned lighthouse state for {}", vpn_ip);
        }
    }
}
