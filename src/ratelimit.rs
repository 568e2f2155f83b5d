//! Rate limiting for outbound recv-error tombstones.
//!
//! Recv-errors are unsigned, so an attacker who can spoof source addresses
//! could use us as a reflector. The limiter always answers during a grace
//! window after process start (peers reconnect fast after we restart), then
//! falls back to a per-source-IP window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Policy for answering unknown or replayed sessions with a recv-error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvErrorPolicy {
    /// Answer everyone (subject to the per-IP window).
    Always,
    /// Never answer.
    Never,
    /// Answer only RFC 1918 / loopback sources.
    Private,
}

impl std::str::FromStr for RecvErrorPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always" => Ok(RecvErrorPolicy::Always),
            "never" => Ok(RecvErrorPolicy::Never),
            "private" => Ok(RecvErrorPolicy::Private),
            _ => anyhow::bail!("Unsupported recv_error policy: {}", s),
        }
    }
}

/// Configuration for the recv-error limiter.
pub struct RecvErrorConfig {
    pub policy: RecvErrorPolicy,
    /// Answer unconditionally for this long after start.
    pub startup_grace: Duration,
    /// After the grace period, at most `max_per_window` per IP and window.
    pub window: Duration,
    pub max_per_window: u32,
}

impl Default for RecvErrorConfig {
    fn default() -> Self {
        Self {
            policy: RecvErrorPolicy::Always,
            startup_grace: Duration::from_secs(300),
            window: Duration::from_secs(1),
            max_per_window: 5,
        }
    }
}

struct IpWindow {
    count: u32,
    window_start: Instant,
}

/// Decides whether to send a recv-error to a given source IP.
pub struct RecvErrorLimiter {
    config: RecvErrorConfig,
    started: Instant,
    ip_states: Mutex<HashMap<IpAddr, IpWindow>>,
}

impl RecvErrorLimiter {
    pub fn new(config: RecvErrorConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            ip_states: Mutex::new(HashMap::new()),
        }
    }

    fn is_private(ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
            IpAddr::V6(v6) => v6.is_loopback(),
        }
    }

    /// Should we answer this source right now?
    pub fn should_send(&self, ip: IpAddr) -> bool {
        match self.config.policy {
            RecvErrorPolicy::Never => return false,
            RecvErrorPolicy::Private if !Self::is_private(ip) => return false,
            _ => {}
        }

        if self.started.elapsed() < self.config.startup_grace {
            return true;
        }

        let now = Instant::now();
        let mut states = self.ip_states.lock().unwrap();
        let state = states.entry(ip).or_insert(IpWindow {
            count: 0,
            window_start: now,
        });

        if now.duration_since(state.window_start) >= self.config.window {
            state.count = 0;
            state.window_start = now;
        }

        if state.count >= self.config.max_per_window {
            return false;
        }

        state.count += 1;
        true
    }

    /// Drop stale per-IP tracking entries.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.config.window * 2;
        self.ip_states
            .lock()
            .unwrap()
            .retain(|_, state| now.duration_since(state.window_start) < window);
    }
}
