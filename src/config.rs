use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::lighthouse::AllowRule;
use crate::ratelimit::{RecvErrorConfig, RecvErrorPolicy};

/// Top-level configuration for the canopy daemon.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub tun: TunConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub lighthouse: LighthouseConfig,
}

/// Daemon runtime settings.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Packet worker count; each worker owns its own scratch buffers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            workers: default_workers(),
            log_level: "info".to_string(),
        }
    }
}

/// TUN device settings; the address doubles as our overlay identity.
#[derive(Debug, Deserialize)]
pub struct TunConfig {
    #[serde(default = "default_tun_name")]
    pub name: String,
    #[serde(default = "default_tun_address")]
    pub address: Ipv4Addr,
    #[serde(default = "default_mask_bits")]
    pub mask_bits: u8,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            address: default_tun_address(),
            mask_bits: default_mask_bits(),
            mtu: default_mtu(),
        }
    }
}

impl TunConfig {
    pub fn netmask(&self) -> Ipv4Addr {
        let mask = if self.mask_bits == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.mask_bits))
        };
        Ipv4Addr::from(mask)
    }
}

/// Security settings.
#[derive(Debug, Deserialize)]
pub struct SecurityConfig {
    /// "always", "never" or "private".
    #[serde(default = "default_recv_error")]
    pub recv_error: String,
    /// Answer every unknown sender for this long after start.
    #[serde(default = "default_recv_error_grace")]
    pub recv_error_grace_secs: u64,
    #[serde(default = "default_roaming_suppress")]
    pub roaming_suppress_secs: u64,
    /// Paths to trusted CA certificates.
    #[serde(default)]
    pub ca_certs: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            recv_error: default_recv_error(),
            recv_error_grace_secs: default_recv_error_grace(),
            roaming_suppress_secs: default_roaming_suppress(),
            ca_certs: Vec::new(),
        }
    }
}

impl SecurityConfig {
    pub fn recv_error_config(&self) -> Result<RecvErrorConfig> {
        let policy: RecvErrorPolicy = self.recv_error.parse()?;
        Ok(RecvErrorConfig {
            policy,
            startup_grace: Duration::from_secs(self.recv_error_grace_secs),
            ..RecvErrorConfig::default()
        })
    }

    pub fn roaming_suppress(&self) -> Duration {
        Duration::from_secs(self.roaming_suppress_secs)
    }
}

/// Allow-list entry for peer roaming, e.g. `{ cidr = "192.168.0.0/16", allow = false }`.
#[derive(Debug, Deserialize, Clone)]
pub struct AllowEntry {
    pub cidr: String,
    pub allow: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct LighthouseConfig {
    #[serde(default)]
    pub remote_allow_list: Vec<AllowEntry>,
}

impl LighthouseConfig {
    pub fn allow_rules(&self) -> Result<Vec<AllowRule>> {
        self.remote_allow_list
            .iter()
            .map(|entry| {
                let (net, bits) = entry
                    .cidr
                    .split_once('/')
                    .context(format!("Invalid CIDR: {}", entry.cidr))?;
                Ok(AllowRule {
                    net: net.parse().context(format!("Invalid CIDR: {}", entry.cidr))?,
                    bits: bits.parse().context(format!("Invalid CIDR: {}", entry.cidr))?,
                    allow: entry.allow,
                })
            })
            .collect()
    }
}

fn default_port() -> u16 {
    4242
}
fn default_workers() -> usize {
    2
}
fn default_tun_name() -> String {
    "canopy0".to_string()
}
fn default_tun_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 128, 0, 1)
}
fn default_mask_bits() -> u8 {
    24
}
fn default_mtu() -> u16 {
    1300
}
fn default_recv_error() -> String {
    "always".to_string()
}
fn default_recv_error_grace() -> u64 {
    300
}
fn default_roaming_suppress() -> u64 {
    crate::interface::ROAMING_SUPPRESS.as_secs()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/canopy/config.toml",
            "~/.canopy/config.toml",
            "./config.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }
}
