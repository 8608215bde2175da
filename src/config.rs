//! Configuration for the Teredo endpoint.
//!
//! The on-disk format is JSON. Key names match the historical miredo
//! configuration keys (`RelayType`, `ServerAddress`, ...), so the file maps
//! one-to-one onto documentation written for the original daemon.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use crate::teredo;

/// Operational role, as spelled in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayType {
    /// Tunnel is configured but no Teredo service runs.
    Disabled,
    /// Tunneled host behind a NAT.
    Client,
    /// Historical alias for `client`.
    Autoclient,
    /// Relay assuming a restricted NAT environment.
    Restricted,
    /// Relay assuming a cone NAT environment.
    Cone,
}

impl Default for RelayType {
    fn default() -> Self {
        RelayType::Client
    }
}

/// On-disk configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MiredoConfig {
    /// Syslog facility name; accepted for compatibility and validated,
    /// the log transport itself is set up by the subscriber in `main`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog_facility: Option<String>,

    /// Operational role (default: client).
    #[serde(default)]
    pub relay_type: RelayType,

    /// Remote Teredo server IPv4 address (client mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<Ipv4Addr>,

    /// Install a default IPv6 route through the tunnel (client mode).
    #[serde(default = "default_true")]
    pub default_route: bool,

    /// Local IPv4 address the server listens on (relay/server mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_bind_address: Option<Ipv4Addr>,

    /// Teredo prefix; only the high 32 bits are significant.
    #[serde(default = "default_prefix")]
    pub prefix: Ipv6Addr,

    /// UDP bind IPv4 address (0.0.0.0 = any).
    #[serde(default = "default_bind_address")]
    pub bind_address: Ipv4Addr,

    /// UDP bind port (0 = ephemeral).
    #[serde(default)]
    pub bind_port: u16,

    /// Desired tunnel interface name; otherwise driver-assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_prefix() -> Ipv6Addr {
    teredo::DEFAULT_PREFIX
}

fn default_bind_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

impl Default for MiredoConfig {
    fn default() -> Self {
        Self {
            syslog_facility: None,
            relay_type: RelayType::default(),
            server_address: None,
            default_route: true,
            server_bind_address: None,
            prefix: default_prefix(),
            bind_address: default_bind_address(),
            bind_port: 0,
            interface_name: None,
        }
    }
}

/// Facility names understood by `SyslogFacility`.
const FACILITIES: &[&str] = &[
    "auth", "cron", "daemon", "ftp", "kern", "local0", "local1", "local2", "local3", "local4",
    "local5", "local6", "local7", "lpr", "mail", "news", "syslog", "user", "uucp",
];

impl MiredoConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: MiredoConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(facility) = &self.syslog_facility {
            if !FACILITIES.contains(&facility.as_str()) {
                anyhow::bail!("Unknown syslog facility: {facility}");
            }
        }

        match self.relay_type {
            RelayType::Client | RelayType::Autoclient => {
                if self.server_address.is_none() {
                    anyhow::bail!("ServerAddress is required in client mode");
                }
            }
            RelayType::Disabled | RelayType::Restricted | RelayType::Cone => {}
        }

        if let Some(name) = &self.interface_name {
            if name.is_empty() || name.len() >= crate::tun::IFNAMSIZ {
                anyhow::bail!("Invalid InterfaceName: {name:?}");
            }
        }

        Ok(())
    }
}

/// Operational role after configuration parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Disabled,
    Client,
    RestrictedNat,
    ConeNat,
}

impl OperationMode {
    /// True when a Teredo client runs (and with it the privileged helper).
    pub fn is_client(self) -> bool {
        matches!(self, OperationMode::Client)
    }

    /// True when any Teredo service (client or relay) runs at all.
    pub fn is_enabled(self) -> bool {
        !matches!(self, OperationMode::Disabled)
    }
}

/// Immutable record handed to the worker process.
///
/// The unprivileged uid and the chroot directory travel here rather than in
/// process-wide state; the supervisor builds one record per generation.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Desired tunnel interface name; `None` lets the driver pick.
    pub ifname: Option<String>,
    /// Operational role.
    pub mode: OperationMode,
    /// Teredo prefix (high 32 bits significant in relay/server mode).
    pub prefix: Ipv6Addr,
    /// Remote server IPv4 (client) or local server bind IPv4 (server).
    pub server_v4: Option<Ipv4Addr>,
    /// UDP bind IPv4 address.
    pub bind_v4: Ipv4Addr,
    /// UDP bind port, host byte order; 0 = ephemeral.
    pub bind_port: u16,
    /// Install a default IPv6 route through the tunnel (client only).
    pub default_route: bool,
    /// Uid to drop to after tunnel setup.
    pub uid: libc::uid_t,
    /// Optional directory to chroot into before dropping privileges.
    pub chroot_dir: Option<PathBuf>,
}

impl WorkerConfig {
    /// Build the worker record from a parsed configuration.
    pub fn from_config(
        config: &MiredoConfig,
        uid: libc::uid_t,
        chroot_dir: Option<PathBuf>,
    ) -> Self {
        let mode = match config.relay_type {
            RelayType::Disabled => OperationMode::Disabled,
            RelayType::Client | RelayType::Autoclient => OperationMode::Client,
            RelayType::Restricted => OperationMode::RestrictedNat,
            RelayType::Cone => OperationMode::ConeNat,
        };

        // In client mode ServerAddress is the remote server; otherwise
        // ServerBindAddress selects the local server socket (if any).
        let server_v4 = match mode {
            OperationMode::Client => config.server_address,
            _ => config.server_bind_address,
        };

        Self {
            ifname: config.interface_name.clone(),
            mode,
            prefix: config.prefix,
            server_v4,
            bind_v4: config.bind_address,
            bind_port: config.bind_port,
            default_route: config.default_route,
            uid,
            chroot_dir,
        }
    }
}
