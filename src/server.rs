//! Teredo server: bootstrap authority for clients.
//!
//! The server listens on two consecutive IPv4 addresses (clients probe the
//! second one to classify their NAT). The qualification dialogue itself is
//! protocol-layer work; the datapath here accepts one datagram per tick,
//! forwards traffic for its own prefix toward the embedded client mapping
//! (initial bubbles), and hands everything else to the tunnel.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::event::ReadSet;
use crate::teredo::TeredoEndpoint;
use crate::tun::Tunnel;
use crate::TEREDO_PORT;

/// Capability contract the event loop drives.
pub trait Server {
    /// Add the server sockets to the readiness set.
    fn register_readable(&self, set: &mut ReadSet) -> RawFd;

    /// Handle one datagram if a socket is ready.
    fn process_packet(&mut self, set: &ReadSet);

    /// Teredo prefix served by this server (high 32 bits).
    fn set_prefix(&mut self, prefix: u32);

    /// Tunnel that receives traffic bound for the native IPv6 side.
    fn set_tunnel(&mut self, tunnel: Rc<dyn Tunnel>);

    /// Did both UDP sockets actually bind?
    fn is_ready(&self) -> bool;
}

const MAX_DATAGRAM: usize = 65535;

/// Concrete Teredo server.
pub struct TeredoServer {
    primary: Option<UdpSocket>,
    secondary: Option<UdpSocket>,
    prefix: u32,
    tunnel: Option<Rc<dyn Tunnel>>,
}

impl TeredoServer {
    /// Bind the server to `primary` and `secondary` on the Teredo service
    /// port. The secondary address must be the immediate successor of the
    /// primary; [`secondary_of`](Self::secondary_of) computes it.
    pub fn new(primary: Ipv4Addr, secondary: Ipv4Addr) -> Self {
        Self::bound_to(primary, secondary, TEREDO_PORT)
    }

    /// Same as [`new`](Self::new) on a non-standard UDP port.
    pub fn bound_to(primary: Ipv4Addr, secondary: Ipv4Addr, port: u16) -> Self {
        Self {
            primary: bind_socket(primary, port),
            secondary: bind_socket(secondary, port),
            prefix: 0,
            tunnel: None,
        }
    }

    /// The numerically next IPv4 address (big-endian increment).
    pub fn secondary_of(primary: Ipv4Addr) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(primary).wrapping_add(1))
    }

    /// Local port of the primary socket.
    pub fn local_port(&self) -> Option<u16> {
        self.primary
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    fn handle_datagram(&self, socket: &UdpSocket) {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("server receive error: {}", e);
                return;
            }
        };
        let payload = &buf[..len];

        let dst = match ipv6_destination(payload) {
            Some(dst) => dst,
            None => {
                debug!("dropping malformed server datagram from {}", from);
                return;
            }
        };

        if let Ok(endpoint) = TeredoEndpoint::from_ipv6(&dst, self.prefix) {
            // Traffic for one of our clients: pass the bubble along to its
            // NAT mapping so the binding opens.
            if let Some(primary) = &self.primary {
                if let Err(e) = primary.send_to(payload, SocketAddr::V4(endpoint.mapped_socket())) {
                    debug!("bubble forward to {} failed: {}", endpoint.mapped_socket(), e);
                }
            }
            return;
        }

        match &self.tunnel {
            Some(tunnel) => {
                if let Err(e) = tunnel.send_packet(payload) {
                    debug!("tunnel delivery failed: {}", e);
                }
            }
            None => debug!("no tunnel attached, dropping packet for {}", dst),
        }
    }
}

impl Server for TeredoServer {
    fn register_readable(&self, set: &mut ReadSet) -> RawFd {
        let mut max_fd = -1;
        for socket in [&self.primary, &self.secondary].into_iter().flatten() {
            max_fd = max_fd.max(set.register(socket.as_raw_fd()));
        }
        max_fd
    }

    fn process_packet(&mut self, set: &ReadSet) {
        let ready = [&self.primary, &self.secondary]
            .into_iter()
            .flatten()
            .find(|socket| set.contains(socket.as_raw_fd()));

        if let Some(socket) = ready {
            self.handle_datagram(socket);
        }
    }

    fn set_prefix(&mut self, prefix: u32) {
        self.prefix = prefix;
    }

    fn set_tunnel(&mut self, tunnel: Rc<dyn Tunnel>) {
        self.tunnel = Some(tunnel);
    }

    fn is_ready(&self) -> bool {
        self.primary.is_some() && self.secondary.is_some()
    }
}

fn bind_socket(addr: Ipv4Addr, port: u16) -> Option<UdpSocket> {
    let socket = match UdpSocket::bind(SocketAddrV4::new(addr, port)) {
        Ok(socket) => socket,
        Err(e) => {
            warn!("server UDP bind to {}:{} failed: {}", addr, port, e);
            return None;
        }
    };
    if let Err(e) = socket.set_nonblocking(true) {
        warn!("cannot make a server socket non-blocking: {}", e);
        return None;
    }
    Some(socket)
}

fn ipv6_destination(packet: &[u8]) -> Option<Ipv6Addr> {
    if packet.len() < 40 || packet[0] >> 4 != 6 {
        return None;
    }
    let octets: [u8; 16] = packet[24..40].try_into().ok()?;
    Some(Ipv6Addr::from(octets))
}
