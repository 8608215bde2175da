//! Teredo relay: UDP encapsulation of the tunnel's IPv6 traffic.
//!
//! The relay owns the Teredo UDP socket and the mapping between IPv6
//! destinations and UDP/IPv4 endpoints. Qualification, peer discovery and
//! bubble exchange belong to the protocol layer above; what lives here is
//! the datapath the event loop drives: encapsulate outbound packets,
//! decapsulate inbound datagrams into the tunnel, and keep the peer
//! endpoint cache fresh.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::ReadSet;
use crate::privsep::PrivChannel;
use crate::teredo::{self, TeredoEndpoint};
use crate::tun::Tunnel;
use crate::TEREDO_PORT;

/// Capability contract the event loop drives.
pub trait Relay {
    /// Add the relay socket to the readiness set.
    fn register_readable(&self, set: &mut ReadSet) -> RawFd;

    /// Time-driven housekeeping; called every tick, must not block.
    fn process(&mut self);

    /// Read one UDP datagram if ready, decapsulate it into the tunnel.
    fn receive_packet(&mut self, set: &ReadSet) -> Result<()>;

    /// Encapsulate one IPv6 packet from the tunnel into a Teredo datagram.
    fn send_packet(&mut self, packet: &[u8]) -> Result<()>;

    /// Did the UDP socket actually bind?
    fn is_ready(&self) -> bool;
}

/// How long an endpoint learned from inbound traffic stays valid.
const PEER_LIFETIME: Duration = Duration::from_secs(30);

/// How often the peer cache is swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Largest encapsulated datagram we accept.
const MAX_DATAGRAM: usize = 65535;

/// The two ways a relay comes into existence (client vs. plain relay use
/// different construction data; everything downstream is shared).
enum RelayKind {
    Client {
        server: Ipv4Addr,
        default_route: bool,
        nonce: [u8; 8],
        channel: PrivChannel,
        routes_installed: bool,
    },
    Plain {
        prefix: u32,
        cone: bool,
    },
}

struct Peer {
    endpoint: SocketAddrV4,
    last_rx: Instant,
}

/// Concrete Teredo relay (client or plain relay variant).
pub struct TeredoRelay {
    socket: Option<UdpSocket>,
    tunnel: Rc<dyn Tunnel>,
    kind: RelayKind,
    peers: HashMap<Ipv6Addr, Peer>,
    last_sweep: Instant,
}

impl TeredoRelay {
    /// Client construction: traffic without a better endpoint goes to the
    /// Teredo server; the privilege channel applies address and route
    /// changes when qualification hands out a new mapping.
    pub fn client(
        tunnel: Rc<dyn Tunnel>,
        channel: PrivChannel,
        server: Ipv4Addr,
        bind_port: u16,
        bind_ip: Ipv4Addr,
        default_route: bool,
        nonce: [u8; 8],
    ) -> Self {
        Self {
            socket: bind_socket(bind_ip, bind_port),
            tunnel,
            kind: RelayKind::Client {
                server,
                default_route,
                nonce,
                channel,
                routes_installed: false,
            },
            peers: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    /// Plain relay construction: endpoints are embedded in the Teredo
    /// addresses under `prefix`.
    pub fn relay(
        tunnel: Rc<dyn Tunnel>,
        prefix: u32,
        bind_port: u16,
        bind_ip: Ipv4Addr,
        cone: bool,
    ) -> Self {
        Self {
            socket: bind_socket(bind_ip, bind_port),
            tunnel,
            kind: RelayKind::Plain { prefix, cone },
            peers: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    /// Wire-level port the relay actually bound.
    pub fn local_port(&self) -> Option<u16> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    /// Qualification nonce drawn at construction (client only).
    pub fn qualification_nonce(&self) -> Option<[u8; 8]> {
        match &self.kind {
            RelayKind::Client { nonce, .. } => Some(*nonce),
            RelayKind::Plain { .. } => None,
        }
    }

    /// Apply a freshly qualified Teredo address (client only): delegates
    /// the address to the privileged helper, installing the tunnel route
    /// on the first transition.
    pub fn configure_endpoint(&mut self, addr: Ipv6Addr) -> Result<()> {
        match &mut self.kind {
            RelayKind::Client {
                default_route,
                channel,
                routes_installed,
                ..
            } => {
                channel.set_address(addr, 32)?;
                if !*routes_installed {
                    if *default_route {
                        channel.add_route(Ipv6Addr::UNSPECIFIED, 0)?;
                    } else {
                        channel.add_route(teredo::DEFAULT_PREFIX, 32)?;
                    }
                    *routes_installed = true;
                }
                info!("Teredo client address {} configured", addr);
                Ok(())
            }
            RelayKind::Plain { .. } => Err(Error::service(
                "endpoint configuration only applies to a client relay",
            )),
        }
    }

    /// Map an IPv6 destination to the UDP endpoint to encapsulate toward.
    fn resolve(&self, dst: &Ipv6Addr) -> Option<SocketAddrV4> {
        if let Some(peer) = self.peers.get(dst) {
            if peer.last_rx.elapsed() < PEER_LIFETIME {
                return Some(peer.endpoint);
            }
        }

        match self.kind {
            RelayKind::Client { server, .. } => {
                if let Ok(endpoint) = TeredoEndpoint::from_ipv6(dst, teredo::TEREDO_PREFIX) {
                    return Some(endpoint.mapped_socket());
                }
                // Anything else is for the IPv6 internet; the server side
                // relays it onward.
                Some(SocketAddrV4::new(server, TEREDO_PORT))
            }
            RelayKind::Plain { prefix, cone } => {
                let endpoint = TeredoEndpoint::from_ipv6(dst, prefix).ok()?;
                // Behind a restricted NAT the peer's mapping only opens
                // after a bubble exchange; until the peer shows up in the
                // cache the packet cannot be delivered.
                if cone || endpoint.is_cone() {
                    Some(endpoint.mapped_socket())
                } else {
                    None
                }
            }
        }
    }
}

impl Relay for TeredoRelay {
    fn register_readable(&self, set: &mut ReadSet) -> RawFd {
        match &self.socket {
            Some(socket) => set.register(socket.as_raw_fd()),
            None => -1,
        }
    }

    fn process(&mut self) {
        if self.last_sweep.elapsed() >= SWEEP_INTERVAL {
            let before = self.peers.len();
            self.peers.retain(|_, peer| peer.last_rx.elapsed() < PEER_LIFETIME);
            if self.peers.len() != before {
                debug!("expired {} stale peer(s)", before - self.peers.len());
            }
            self.last_sweep = Instant::now();
        }
    }

    fn receive_packet(&mut self, set: &ReadSet) -> Result<()> {
        let socket = match &self.socket {
            Some(socket) if set.contains(socket.as_raw_fd()) => socket,
            _ => return Ok(()),
        };

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let payload = &buf[..len];

        let src = match ipv6_source(payload) {
            Some(src) => src,
            None => {
                debug!("dropping malformed datagram from {}", from);
                return Ok(());
            }
        };

        // The NAT mapping that just reached us is the freshest route back.
        if let SocketAddr::V4(endpoint) = from {
            self.peers.insert(
                src,
                Peer {
                    endpoint,
                    last_rx: Instant::now(),
                },
            );
        }

        self.tunnel.send_packet(payload)
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::service("relay socket is not ready"))?;

        let dst = match ipv6_destination(packet) {
            Some(dst) => dst,
            None => {
                debug!("refusing to encapsulate a non-IPv6 packet");
                return Ok(());
            }
        };

        let target = match self.resolve(&dst) {
            Some(target) => target,
            None => {
                debug!("no usable endpoint for {}, packet dropped", dst);
                return Ok(());
            }
        };

        socket.send_to(packet, SocketAddr::V4(target))?;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.socket.is_some()
    }
}

/// Bind the Teredo UDP socket; `None` leaves the relay constructed but not
/// ready (the worker turns that into a startup diagnostic).
fn bind_socket(bind_ip: Ipv4Addr, bind_port: u16) -> Option<UdpSocket> {
    let socket = match UdpSocket::bind(SocketAddrV4::new(bind_ip, bind_port)) {
        Ok(socket) => socket,
        Err(e) => {
            warn!("UDP bind to {}:{} failed: {}", bind_ip, bind_port, e);
            return None;
        }
    };
    if let Err(e) = socket.set_nonblocking(true) {
        warn!("cannot make the Teredo socket non-blocking: {}", e);
        return None;
    }
    Some(socket)
}

/// Source address of an IPv6 packet, if the header is sane.
fn ipv6_source(packet: &[u8]) -> Option<Ipv6Addr> {
    ipv6_field(packet, 8)
}

/// Destination address of an IPv6 packet, if the header is sane.
fn ipv6_destination(packet: &[u8]) -> Option<Ipv6Addr> {
    ipv6_field(packet, 24)
}

fn ipv6_field(packet: &[u8], offset: usize) -> Option<Ipv6Addr> {
    if packet.len() < 40 || packet[0] >> 4 != 6 {
        return None;
    }
    let octets: [u8; 16] = packet[offset..offset + 16].try_into().ok()?;
    Some(Ipv6Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privsep;
    use crate::tun::TunConfigure;
    use bytes::BytesMut;
    use std::cell::RefCell;
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct SinkTunnel {
        delivered: RefCell<Vec<Vec<u8>>>,
    }

    impl Tunnel for SinkTunnel {
        fn register_readable(&self, _set: &mut ReadSet) -> RawFd {
            -1
        }

        fn receive_packet(&self, _set: &ReadSet) -> Result<Option<BytesMut>> {
            Ok(None)
        }

        fn send_packet(&self, packet: &[u8]) -> Result<()> {
            self.delivered.borrow_mut().push(packet.to_vec());
            Ok(())
        }
    }

    fn build_ipv6(src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; 40];
        packet[0] = 6 << 4;
        packet[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        packet[6] = 59; // no next header
        packet[7] = 64;
        packet[8..24].copy_from_slice(&src.octets());
        packet[24..40].copy_from_slice(&dst.octets());
        packet.extend_from_slice(payload);
        packet
    }

    fn free_local_port() -> u16 {
        // Bind-and-release; the port stays free long enough for the test.
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    }

    #[test]
    fn test_header_field_extraction() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let packet = build_ipv6(src, dst, b"hi");

        assert_eq!(ipv6_source(&packet), Some(src));
        assert_eq!(ipv6_destination(&packet), Some(dst));

        assert!(ipv6_destination(&packet[..20]).is_none());
        let mut v4ish = packet.clone();
        v4ish[0] = 4 << 4;
        assert!(ipv6_destination(&v4ish).is_none());
    }

    #[test]
    fn test_configured_port_reaches_the_wire() {
        let port = free_local_port();
        let relay = TeredoRelay::relay(
            Rc::new(SinkTunnel::default()),
            teredo::TEREDO_PREFIX,
            port,
            Ipv4Addr::LOCALHOST,
            true,
        );

        assert!(relay.is_ready());
        assert_eq!(relay.local_port(), Some(port));
    }

    #[test]
    fn test_ephemeral_port_when_zero() {
        let relay = TeredoRelay::relay(
            Rc::new(SinkTunnel::default()),
            teredo::TEREDO_PREFIX,
            0,
            Ipv4Addr::LOCALHOST,
            true,
        );

        assert!(relay.is_ready());
        assert_ne!(relay.local_port(), Some(0));
    }

    #[test]
    fn test_bind_conflict_leaves_relay_not_ready() {
        let holder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let relay = TeredoRelay::relay(
            Rc::new(SinkTunnel::default()),
            teredo::TEREDO_PREFIX,
            port,
            Ipv4Addr::LOCALHOST,
            true,
        );
        assert!(!relay.is_ready());
        assert_eq!(relay.local_port(), None);
    }

    #[test]
    fn test_outbound_follows_embedded_endpoint() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_port = peer.local_addr().unwrap().port();
        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

        let mut relay = TeredoRelay::relay(
            Rc::new(SinkTunnel::default()),
            teredo::TEREDO_PREFIX,
            0,
            Ipv4Addr::LOCALHOST,
            true,
        );

        let dst = TeredoEndpoint {
            server: Ipv4Addr::new(192, 0, 2, 1),
            flags: teredo::CONE_FLAG,
            mapped_addr: Ipv4Addr::LOCALHOST,
            mapped_port: peer_port,
        }
        .to_ipv6(teredo::TEREDO_PREFIX);

        let packet = build_ipv6("2001:db8::1".parse().unwrap(), dst, b"ping");
        relay.send_packet(&packet).unwrap();

        let mut buf = [0u8; 128];
        let (len, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &packet[..]);
    }

    #[test]
    fn test_restricted_relay_waits_for_bubble() {
        let mut relay = TeredoRelay::relay(
            Rc::new(SinkTunnel::default()),
            teredo::TEREDO_PREFIX,
            0,
            Ipv4Addr::LOCALHOST,
            false,
        );

        // Destination behind a restricted NAT, never heard from: no
        // endpoint can be used yet, the packet is dropped silently.
        let dst = TeredoEndpoint {
            server: Ipv4Addr::new(192, 0, 2, 1),
            flags: 0,
            mapped_addr: Ipv4Addr::new(203, 0, 113, 1),
            mapped_port: 4096,
        }
        .to_ipv6(teredo::TEREDO_PREFIX);

        let packet = build_ipv6("2001:db8::1".parse().unwrap(), dst, b"ping");
        relay.send_packet(&packet).unwrap();
        assert!(relay.peers.is_empty());
    }

    #[test]
    fn test_inbound_learns_peer_and_feeds_tunnel() {
        let tunnel = Rc::new(SinkTunnel::default());
        let mut relay = TeredoRelay::relay(
            tunnel.clone(),
            teredo::TEREDO_PREFIX,
            0,
            Ipv4Addr::LOCALHOST,
            true,
        );
        let relay_port = relay.local_port().unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

        let src: Ipv6Addr = "2001:db8::77".parse().unwrap();
        let packet = build_ipv6(src, "2001:db8::1".parse().unwrap(), b"pong");
        peer.send_to(&packet, ("127.0.0.1", relay_port)).unwrap();

        let mut set = ReadSet::new();
        relay.register_readable(&mut set);
        assert_eq!(set.wait(Duration::from_secs(1)).unwrap(), 1);

        relay.receive_packet(&set).unwrap();
        assert_eq!(*tunnel.delivered.borrow(), vec![packet.clone()]);
        assert_eq!(relay.peers.len(), 1);

        // The learned mapping now routes traffic for that source, even
        // though the address carries no usable embedded endpoint.
        let reply = build_ipv6("2001:db8::1".parse().unwrap(), src, b"re");
        relay.send_packet(&reply).unwrap();
        let mut buf = [0u8; 128];
        let (len, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &reply[..]);
    }

    struct NullConfigure {
        ops: Arc<Mutex<Vec<String>>>,
    }

    impl TunConfigure for NullConfigure {
        fn set_state(&self, _up: bool) -> Result<()> {
            Ok(())
        }

        fn set_address(&self, addr: &Ipv6Addr, prefix_len: u8) -> Result<()> {
            self.ops
                .lock()
                .unwrap()
                .push(format!("addr {addr}/{prefix_len}"));
            Ok(())
        }

        fn remove_address(&self, _addr: &Ipv6Addr, _prefix_len: u8) -> Result<()> {
            Ok(())
        }

        fn add_route(&self, dest: &Ipv6Addr, prefix_len: u8) -> Result<()> {
            self.ops
                .lock()
                .unwrap()
                .push(format!("route {dest}/{prefix_len}"));
            Ok(())
        }

        fn remove_route(&self, _dest: &Ipv6Addr, _prefix_len: u8) -> Result<()> {
            Ok(())
        }

        fn set_mtu(&self, _mtu: u32) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_client_endpoint_configuration_goes_through_helper() {
        let (worker, helper) = UnixStream::pair().unwrap();
        let ops = Arc::new(Mutex::new(Vec::new()));
        let device = NullConfigure { ops: ops.clone() };
        let handle = std::thread::spawn(move || privsep::helper_loop(helper, &device));

        let mut relay = TeredoRelay::client(
            Rc::new(SinkTunnel::default()),
            PrivChannel::from_stream(worker),
            Ipv4Addr::new(192, 0, 2, 1),
            0,
            Ipv4Addr::LOCALHOST,
            false,
            [7; 8],
        );
        assert_eq!(relay.qualification_nonce(), Some([7; 8]));

        let addr = TeredoEndpoint {
            server: Ipv4Addr::new(192, 0, 2, 1),
            flags: 0,
            mapped_addr: Ipv4Addr::new(203, 0, 113, 2),
            mapped_port: 9999,
        }
        .to_ipv6(teredo::TEREDO_PREFIX);

        relay.configure_endpoint(addr).unwrap();
        // A second transition re-applies the address but not the route.
        relay.configure_endpoint(addr).unwrap();

        drop(relay);
        handle.join().unwrap();

        let ops = ops.lock().unwrap();
        assert_eq!(
            *ops,
            vec![
                format!("addr {addr}/32"),
                format!("route {}/32", teredo::DEFAULT_PREFIX),
                format!("addr {addr}/32"),
            ]
        );
    }
}
