use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use log::{debug, error, info, warn};
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;

use canopy::config::Config;
use canopy::conn_manager::ConnectionManager;
use canopy::control::RelayManager;
use canopy::firewall::AllowAll;
use canopy::handshake::HandshakeManager;
use canopy::hostmap::Hostmap;
use canopy::interface::{InsideWriter, Interface, InterfaceDeps, WorkerScratch};
use canopy::lighthouse::{Lighthouse, RemoteAllowList};
use canopy::metrics::Metrics;
use canopy::cert::{CaPool, Certificate};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, help = "UDP listen port (overrides config)")]
    port: Option<u16>,
    #[arg(short, long, help = "Packet worker count (overrides config)")]
    workers: Option<usize>,
    #[arg(long, short = 'C', help = "Path to config file")]
    config: Option<std::path::PathBuf>,
    #[arg(long, help = "Do not create a TUN device, discard decrypted packets")]
    no_tun: bool,
}

/// TUN writer sharing one device between workers.
struct TunWriter {
    device: Mutex<tun2::Device>,
}

impl InsideWriter for TunWriter {
    fn write(&self, _queue: usize, data: &[u8]) -> std::io::Result<usize> {
        self.device.lock().unwrap().write(data)
    }
}

/// Discards decrypted packets; `--no-tun` mode for testing connectivity.
struct DiscardInside;

impl InsideWriter for DiscardInside {
    fn write(&self, _queue: usize, data: &[u8]) -> std::io::Result<usize> {
        Ok(data.len())
    }
}

fn load_ca_pool(config: &Config) -> Result<CaPool> {
    let mut pool = CaPool::new();
    for path in &config.security.ca_certs {
        // CA certificates are stored as base64 text for easy handling.
        let text =
            std::fs::read_to_string(path).context(format!("Failed to read CA cert {}", path))?;
        let raw = BASE64
            .decode(text.trim())
            .context(format!("CA cert {} is not valid base64", path))?;
        let cert = Certificate::decode(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to decode CA cert {}: {}", path, e))?;
        let fingerprint = pool
            .add_ca(&cert)
            .map_err(|e| anyhow::anyhow!("Rejected CA cert {}: {}", path, e))?;
        info!("Trusted CA {} ({})", path, fingerprint);
    }
    Ok(pool)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::init();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };
    let port = args.port.unwrap_or(config.daemon.port);
    let workers = args.workers.unwrap_or(config.daemon.workers).max(1);

    info!("Starting canopy on UDP/{} with {} workers...", port, workers);

    let ca_pool = Arc::new(load_ca_pool(&config)?);
    if ca_pool.is_empty() {
        warn!("No CA certificates configured, incoming handshakes cannot be validated");
    }

    let allow_rules = config.lighthouse.allow_rules()?;
    let lighthouse = Arc::new(Lighthouse::new(
        config.tun.address,
        config.tun.mask_bits,
        RemoteAllowList::new(allow_rules),
    ));

    let inside: Arc<dyn InsideWriter> = if args.no_tun {
        warn!("Running without a TUN device, decrypted packets are discarded");
        Arc::new(DiscardInside)
    } else {
        let mut tun_config = tun2::Configuration::default();
        tun_config
            .tun_name(&config.tun.name)
            .address(config.tun.address)
            .netmask(config.tun.netmask())
            .mtu(config.tun.mtu)
            .up();
        let device = tun2::create(&tun_config).context("Failed to create TUN device")?;
        info!(
            "TUN interface '{}' up at {}/{}",
            config.tun.name, config.tun.address, config.tun.mask_bits
        );
        Arc::new(TunWriter {
            device: Mutex::new(device),
        })
    };

    let socket = UdpSocket::bind(("0.0.0.0", port)).context("failed to bind UDP socket")?;
    info!("Listening on UDP/{}", port);

    let hostmap = Arc::new(Hostmap::new());
    let metrics = Metrics::new();

    let lighthouse_for_cb = lighthouse.clone();
    let iface = Arc::new(Interface::new(InterfaceDeps {
        hostmap: hostmap.clone(),
        handshake_manager: Arc::new(HandshakeManager::new()),
        lighthouse: lighthouse.clone(),
        conn_manager: Arc::new(ConnectionManager::new()),
        relay_manager: Arc::new(RelayManager::new()),
        firewall: Arc::new(AllowAll),
        metrics: metrics.clone(),
        outside: Arc::new(socket.try_clone().context("failed to clone UDP socket")?),
        inside,
        lighthouse_callback: Box::new(move |addr, vpn_ip, plaintext, _iface| {
            // Lighthouse replies advertise endpoints for an overlay address.
            match serde_cbor::from_slice::<Vec<SocketAddr>>(plaintext) {
                Ok(endpoints) => {
                    for endpoint in endpoints {
                        lighthouse_for_cb.learn(vpn_ip, endpoint);
                    }
                }
                Err(e) => debug!("Bad lighthouse reply from {:?}: {}", addr, e),
            }
        }),
        handshake_callback: Box::new(move |_iface, addr, via, _packet, h, _hostinfo| {
            // The Noise state machine plugs in here; nothing to do until a
            // peer identity is configured.
            debug!(
                "Handshake from {:?} (via relay: {}) index {}",
                addr,
                via.is_some(),
                h.remote_index
            );
        }),
        recv_error: config.security.recv_error_config()?,
        roaming_suppress: config.security.roaming_suppress(),
    }));

    // Packet workers: blocking reads on socket clones, each with its own
    // scratch buffers and conntrack cache.
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut worker_handles = Vec::new();
    for q in 0..workers {
        let socket = socket.try_clone().context("failed to clone UDP socket")?;
        socket
            .set_read_timeout(Some(Duration::from_secs(1)))
            .context("failed to set socket timeout")?;
        let iface = iface.clone();
        let shutdown = shutdown.clone();

        worker_handles.push(tokio::task::spawn_blocking(move || {
            let mut scratch = WorkerScratch::new(q);
            let mut packet = vec![0u8; u16::MAX as usize];
            while !shutdown.load(Ordering::Relaxed) {
                match socket.recv_from(&mut packet) {
                    Ok((len, addr)) => {
                        iface.read_outside_packets(Some(addr), None, &packet[..len], &mut scratch);
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        error!("Socket error on worker {}: {}", q, e);
                        break;
                    }
                }
            }
            debug!("Worker {} exiting", q);
        }));
    }

    let mut cleanup_interval = interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Exiting...");
                break;
            }
            _ = cleanup_interval.tick() => {
                iface.cleanup();
            }
        }
    }

    // Tell peers we are going away so they tear down instead of timing out.
    for host in hostmap.all_hosts() {
        iface.send_close_tunnel(&host);
    }

    shutdown.store(true, Ordering::Relaxed);
    for handle in worker_handles {
        let _ = handle.await;
    }

    info!("Final stats:\n{}", metrics.to_prometheus());
    Ok(())
}
