//! Teredo tunneling endpoint library
//!
//! Carries IPv6 traffic over UDP/IPv4 (RFC 4380) so hosts behind IPv4 NATs
//! can reach the IPv6 internet. A process runs as a Teredo client, relay,
//! server, or relay+server. The library provides the tunnel device, the
//! UDP event loop, the privilege-separation channel, and the forking
//! supervisor; the binary in `main.rs` wires them to the CLI.

pub mod config;
pub mod error;
pub mod event;
pub mod privsep;
pub mod relay;
pub mod server;
pub mod signal;
pub mod supervisor;
pub mod teredo;
pub mod tun;
pub mod worker;

// Re-export main types
pub use config::{MiredoConfig, OperationMode, WorkerConfig};
pub use error::{Error, Result};
pub use relay::TeredoRelay;
pub use server::TeredoServer;
pub use tun::TunDevice;

/// Default configuration file path.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/miredo/miredo.json";

/// IPv6 minimum MTU, fixed by the Teredo specification for the tunnel.
pub const TEREDO_MTU: u16 = 1280;

/// IANA-assigned Teredo UDP service port.
pub const TEREDO_PORT: u16 = 3544;
