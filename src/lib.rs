//! Inbound data plane of the canopy overlay mesh.
//!
//! Datagrams from the physical network are parsed, matched to a session,
//! authenticated and decrypted under per-peer keys with replay protection,
//! optionally unwrapped or forwarded on behalf of a relayed peer, and finally
//! delivered to the local TUN device after a firewall check. A handful of
//! control signals (lighthouse replies, liveness tests, relay control,
//! recv-error tombstones, close notifications) ride the same UDP transport.

pub mod cert;
pub mod config;
pub mod conn_manager;
pub mod control;
pub mod crypto;
pub mod error;
pub mod firewall;
pub mod handshake;
pub mod header;
pub mod hostmap;
pub mod inbound;
pub mod interface;
pub mod lighthouse;
pub mod metrics;
pub mod ratelimit;
pub mod replay;

// Re-export key types for easier access by consumers
pub use cert::{recombine_cert_and_validate, CaPool, Certificate, CertificateDetails};
pub use config::Config;
pub use conn_manager::ConnectionManager;
pub use control::{ControlMsg, ControlMsgType, RelayManager};
pub use crypto::SessionCipher;
pub use error::{CertError, PacketError};
pub use firewall::{extract_packet, ConntrackCache, Firewall, Packet};
pub use handshake::HandshakeManager;
pub use header::{Header, MsgType, HEADER_LEN};
pub use hostmap::{ConnectionState, HostInfo, Hostmap, Relay, RelayState, RelayType};
pub use interface::{Interface, InterfaceDeps, ViaSender, WorkerScratch};
pub use lighthouse::{Lighthouse, RemoteAllowList};
pub use metrics::Metrics;
pub use ratelimit::{RecvErrorConfig, RecvErrorLimiter, RecvErrorPolicy};
pub use replay::ReplayWindow;
