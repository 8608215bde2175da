//! Readiness multiplexing and the main packet loop.
//!
//! The worker is single-threaded and cooperative: one `select(2)` wait with
//! a 250 ms ceiling is the only suspension point. The short timeout exists
//! so the relay gets its housekeeping called at least four times per second
//! even when no traffic flows.

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;
use crate::relay::Relay;
use crate::server::Server;
use crate::tun::Tunnel;

/// Ceiling on one readiness wait.
pub const TICK: Duration = Duration::from_millis(250);

/// A set of descriptors to be watched for readability.
///
/// Thin wrapper over `fd_set`; rebuilt on every loop iteration since
/// `select` mutates the set in place.
pub struct ReadSet {
    set: libc::fd_set,
    max_fd: RawFd,
}

impl ReadSet {
    pub fn new() -> Self {
        let mut set: libc::fd_set = unsafe { mem::zeroed() };
        unsafe { libc::FD_ZERO(&mut set) };
        Self { set, max_fd: -1 }
    }

    /// Add a descriptor to the set; returns it for max-fd bookkeeping.
    ///
    /// Negative descriptors (a component without a live socket) are ignored.
    pub fn register(&mut self, fd: RawFd) -> RawFd {
        if fd >= 0 {
            debug_assert!(fd < libc::FD_SETSIZE as RawFd);
            unsafe { libc::FD_SET(fd, &mut self.set) };
            if fd > self.max_fd {
                self.max_fd = fd;
            }
        }
        fd
    }

    /// Is the descriptor ready after the last [`wait`](Self::wait)?
    pub fn contains(&self, fd: RawFd) -> bool {
        fd >= 0 && unsafe { libc::FD_ISSET(fd, &self.set) }
    }

    /// Block until a registered descriptor is readable or the timeout
    /// elapses. Returns the number of ready descriptors.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let ret = unsafe {
            libc::select(
                self.max_fd + 1,
                &mut self.set,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            )
        };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }
}

impl Default for ReadSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the packet loop until the signal bridge becomes readable.
///
/// Per tick, in order: signal check, server datagram processing, relay
/// housekeeping, tunnel-to-relay forwarding, relay-to-tunnel forwarding.
/// Transient relay errors are logged and dropped; a tunnel read error is
/// fatal and terminates the loop.
pub fn run(
    signal_fd: RawFd,
    tunnel: &dyn Tunnel,
    mut server: Option<&mut dyn Server>,
    mut relay: Option<&mut dyn Relay>,
) -> Result<()> {
    loop {
        let mut readset = ReadSet::new();
        readset.register(signal_fd);

        if let Some(server) = server.as_deref_mut() {
            server.register_readable(&mut readset);
        }
        if let Some(relay) = relay.as_deref_mut() {
            tunnel.register_readable(&mut readset);
            relay.register_readable(&mut readset);
        }

        match readset.wait(TICK) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => break,
            Err(e) => return Err(e.into()),
        }

        if readset.contains(signal_fd) {
            break;
        }

        if let Some(server) = server.as_deref_mut() {
            server.process_packet(&readset);
        }

        if let Some(relay) = relay.as_deref_mut() {
            relay.process();

            // Packet transmission: IPv6 from the kernel into the Teredo cloud.
            if let Some(packet) = tunnel.receive_packet(&readset)? {
                if let Err(e) = relay.send_packet(&packet) {
                    warn!("Failed to relay outbound packet: {}", e);
                }
            }

            // Packet reception: Teredo datagram back into the kernel.
            if let Err(e) = relay.receive_packet(&readset) {
                debug!("Inbound relay processing failed: {}", e);
            }
        }
    }

    Ok(())
}
