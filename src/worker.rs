//! The unprivileged worker process.
//!
//! Forked by the supervisor once per generation. Sets up the tunnel while
//! still privileged, forks the helper (client mode), drops privileges for
//! good, builds the relay/server objects and runs the packet loop until
//! the signal bridge fires.

use std::ffi::CString;
use std::net::Ipv6Addr;
use std::os::fd::RawFd;
use std::rc::Rc;

use tracing::{error, info, warn};

use crate::config::{OperationMode, WorkerConfig};
use crate::event;
use crate::privsep;
use crate::relay::{Relay, TeredoRelay};
use crate::server::{Server, TeredoServer};
use crate::teredo::{self, NonceSource};
use crate::tun::{TunConfigure, TunDevice, Tunnel};
use crate::TEREDO_MTU;

/// Run one worker generation. Returns 0 on a clean signal-driven exit and
/// -1 on failure; the caller negates this into the process exit code.
pub fn run(config: &WorkerConfig, signal_fd: RawFd) -> i32 {
    let mut nonce_source = config.mode.is_client().then(NonceSource::new);

    // Opening the driver and setting the MTU require privileges (or access
    // to the device file), so both happen before setuid.
    let tunnel = match TunDevice::open(config.ifname.as_deref()) {
        Ok(tunnel) => Rc::new(tunnel),
        Err(e) => {
            error!("Teredo tunnel setup failed: {}", e);
            error!("You should be root to do that.");
            return -1;
        }
    };

    if let Err(e) = tunnel.set_mtu(TEREDO_MTU as u32) {
        error!("Teredo tunnel setup failed: {}", e);
        return -1;
    }

    let mut channel = None;
    if config.mode.is_client() {
        // The client keeps reconfiguring the tunnel long after privileges
        // are gone; a forked helper retains that capability.
        match privsep::fork_helper(&*tunnel) {
            Ok(c) => channel = Some(c),
            Err(e) => {
                error!("Privileged process setup failed: {}", e);
                return -1;
            }
        }
    } else {
        let setup = tunnel
            .set_state(true)
            .and_then(|()| tunnel.set_address(&well_known_address(config.mode), 64))
            .and_then(|()| {
                if config.mode.is_enabled() {
                    tunnel.add_route(&config.prefix, 32)
                } else {
                    Ok(())
                }
            });
        if let Err(e) = setup {
            error!("Teredo routing failed: {}", e);
            error!("You should be root to do that.");
            return -1;
        }
    }

    let helper_pid = channel.as_ref().map(|c| c.helper_pid());

    if let Some(dir) = &config.chroot_dir {
        if let Err(e) = enter_chroot(dir) {
            warn!("chroot to {} failed: {}", dir.display(), e);
        }
    }

    // Definitely drops privileges.
    if unsafe { libc::setuid(config.uid) } != 0 {
        error!(
            "Setting UID failed: {}",
            std::io::Error::last_os_error()
        );
        drop(channel);
        reap_helper(helper_pid);
        return -1;
    }

    // A server may run alongside a relay, or on its own with the relay
    // disabled; only the client role excludes it.
    let mut server = None;
    if !config.mode.is_client() {
        if let Some(server_ip) = config.server_v4 {
            let mut srv = TeredoServer::new(server_ip, TeredoServer::secondary_of(server_ip));
            if !srv.is_ready() {
                error!("Teredo UDP port failure");
                info!("Make sure another instance of the program is not already running.");
                return -1;
            }
            srv.set_prefix(teredo::prefix_of(&config.prefix));
            srv.set_tunnel(tunnel.clone() as Rc<dyn Tunnel>);
            server = Some(srv);
        }
    }

    let mut relay = None;
    if config.mode.is_client() {
        let (Some(server_ip), Some(chan)) = (config.server_v4, channel.take()) else {
            error!("Teredo service failure");
            reap_helper(helper_pid);
            return -1;
        };
        let nonce = match nonce_source.as_mut() {
            Some(source) => source.nonce(),
            None => [0; 8],
        };
        relay = Some(TeredoRelay::client(
            tunnel.clone() as Rc<dyn Tunnel>,
            chan,
            server_ip,
            config.bind_port,
            config.bind_v4,
            config.default_route,
            nonce,
        ));
    } else if config.mode.is_enabled() {
        relay = Some(TeredoRelay::relay(
            tunnel.clone() as Rc<dyn Tunnel>,
            teredo::prefix_of(&config.prefix),
            config.bind_port,
            config.bind_v4,
            config.mode == OperationMode::ConeNat,
        ));
    }

    if config.mode.is_enabled() && !relay.as_ref().is_some_and(|r| r.is_ready()) {
        if config.bind_port != 0 {
            error!(
                "Teredo service port failure: cannot open UDP port {}",
                config.bind_port
            );
        } else {
            error!("Teredo service port failure: cannot open an UDP port");
        }
        info!("Make sure another instance of the program is not already running.");
        drop(relay);
        reap_helper(helper_pid);
        return -1;
    }

    info!("Teredo service started");
    let retval = match event::run(
        signal_fd,
        &*tunnel,
        server.as_mut().map(|s| s as &mut dyn Server),
        relay.as_mut().map(|r| r as &mut dyn Relay),
    ) {
        Ok(()) => 0,
        Err(e) => {
            error!("Teredo service failure: {}", e);
            -1
        }
    };

    // Dropping the relay closes the privilege channel; the helper sees
    // EOF, undoes its interface changes and exits, and is reaped here.
    drop(relay);
    drop(server);
    drop(nonce_source);
    reap_helper(helper_pid);

    info!("Teredo service stopped");
    retval
}

/// Well-known host address assigned to the tunnel in relay/server mode.
fn well_known_address(mode: OperationMode) -> Ipv6Addr {
    match mode {
        OperationMode::RestrictedNat => teredo::RESTRICT_ADDR,
        _ => teredo::CONE_ADDR,
    }
}

fn enter_chroot(dir: &std::path::Path) -> std::io::Result<()> {
    let cdir = CString::new(dir.as_os_str().as_encoded_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    if unsafe { libc::chroot(cdir.as_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::chdir(b"/\0".as_ptr() as *const libc::c_char) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Wait for the privileged helper to terminate.
fn reap_helper(pid: Option<libc::pid_t>) {
    let Some(pid) = pid else { return };
    if pid <= 0 {
        return;
    }
    loop {
        if unsafe { libc::waitpid(pid, std::ptr::null_mut(), 0) } != -1 {
            break;
        }
        if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_address_tracks_mode() {
        assert_eq!(
            well_known_address(OperationMode::RestrictedNat),
            teredo::RESTRICT_ADDR
        );
        assert_eq!(well_known_address(OperationMode::ConeNat), teredo::CONE_ADDR);
        // A disabled relay still brings the tunnel up with the cone address.
        assert_eq!(
            well_known_address(OperationMode::Disabled),
            teredo::CONE_ADDR
        );
    }
}
