//! Linux TUN device for the Teredo tunnel.
//!
//! Owns a point-to-point, unnumbered virtual interface and moves framed
//! IPv6 packets between the kernel and the packet loop. Interface state
//! (flags, address, MTU, routes) is driven through ioctls on a short-lived
//! PF_INET6 datagram socket; the socket never outlives the operation.

use std::ffi::CStr;
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bytes::BytesMut;
use libc::{c_char, c_int, c_short, c_ulong, c_void};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::ReadSet;

/// Maximum interface name length, including the terminating NUL.
pub const IFNAMSIZ: usize = 16;

/// TUN clone device path.
const TUN_DEVICE: &[u8] = b"/dev/net/tun\0";

/// TUNSETIFF ioctl number.
const TUNSETIFF: c_ulong = 0x4004_54ca;

/// SIOCGIFFLAGS - Get interface flags.
const SIOCGIFFLAGS: c_ulong = 0x8913;

/// SIOCSIFFLAGS - Set interface flags.
const SIOCSIFFLAGS: c_ulong = 0x8914;

/// SIOCSIFADDR - Set interface address (in6_ifreq on a PF_INET6 socket).
const SIOCSIFADDR: c_ulong = 0x8916;

/// SIOCDIFADDR - Delete interface address.
const SIOCDIFADDR: c_ulong = 0x8936;

/// SIOCSIFMTU - Set interface MTU.
const SIOCSIFMTU: c_ulong = 0x8922;

/// SIOCGIFINDEX - Get interface index.
const SIOCGIFINDEX: c_ulong = 0x8933;

/// SIOCADDRT - Add a route (in6_rtmsg on a PF_INET6 socket).
const SIOCADDRT: c_ulong = 0x890b;

/// SIOCDELRT - Delete a route.
const SIOCDELRT: c_ulong = 0x890c;

/// IFF_TUN - L3 tunnel device (keeps the packet-information header).
const IFF_TUN: c_short = 0x0001;

/// Interface flag bits.
const IFF_UP: c_short = 0x0001;
const IFF_BROADCAST: c_short = 0x0002;
const IFF_POINTOPOINT: c_short = 0x0010;
const IFF_RUNNING: c_short = 0x0040;
const IFF_NOARP: c_short = 0x0080;
const IFF_MULTICAST: c_short = 0x1000;

/// RTF_UP - route is usable.
const RTF_UP: u32 = 0x0001;

/// On-frame ethertype for IPv6.
///
/// The Linux TUN driver carries `tun_pi.proto` in network byte order, so
/// the two ethertype octets on every frame are `0x86 0xDD` regardless of
/// host endianness; the codec below encodes them with `to_be_bytes`.
const ETHERTYPE_IPV6: u16 = 0x86dd;

/// Frame header: flags (u16) + ethertype (u16).
const FRAME_HEADER_LEN: usize = 4;

/// Largest IPv6 packet the tunnel accepts.
const MAX_PACKET: usize = 65535;

/// Interface request structure (name + flags).
#[repr(C)]
struct IfReqFlags {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

/// Interface request with MTU.
#[repr(C)]
struct IfReqMtu {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_mtu: c_int,
    _pad: [u8; 20],
}

/// Interface request with index.
#[repr(C)]
struct IfReqIndex {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_ifindex: c_int,
    _pad: [u8; 20],
}

/// IPv6 address assignment request (linux in6_ifreq).
#[repr(C)]
struct In6Ifreq {
    ifr6_addr: [u8; 16],
    ifr6_prefixlen: u32,
    ifr6_ifindex: c_int,
}

/// IPv6 route request (linux in6_rtmsg).
#[repr(C)]
struct In6Rtmsg {
    rtmsg_dst: [u8; 16],
    rtmsg_src: [u8; 16],
    rtmsg_gateway: [u8; 16],
    rtmsg_type: u32,
    rtmsg_dst_len: u16,
    rtmsg_src_len: u16,
    rtmsg_metric: u32,
    rtmsg_info: c_ulong,
    rtmsg_flags: u32,
    rtmsg_ifindex: c_int,
}

/// Check that an MTU fits the tunnel: IPv6 minimum up to the 16-bit field.
pub fn validate_mtu(mtu: u32) -> Result<()> {
    if mtu < 1280 {
        return Err(Error::invalid(format!("IPv6 MTU too small (<1280): {mtu}")));
    }
    if mtu > 65535 {
        return Err(Error::invalid(format!("IPv6 MTU too big (>65535): {mtu}")));
    }
    Ok(())
}

/// Check an IPv6 prefix length.
pub fn validate_prefix_len(prefix_len: u8) -> Result<()> {
    if prefix_len > 128 {
        return Err(Error::invalid(format!(
            "IPv6 prefix length too long: {prefix_len}"
        )));
    }
    Ok(())
}

/// Prepend the TUN frame header (flags = 0, ethertype = IPv6).
pub fn frame_packet(packet: &[u8]) -> Result<BytesMut> {
    if packet.len() > MAX_PACKET {
        return Err(Error::invalid(format!(
            "packet too large for tunnel: {} octets",
            packet.len()
        )));
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + packet.len());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
    frame.extend_from_slice(packet);
    Ok(frame)
}

/// Strip the TUN frame header; `None` unless the frame carries IPv6.
pub fn unframe_packet(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < FRAME_HEADER_LEN {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[2], frame[3]]);
    if ethertype != ETHERTYPE_IPV6 {
        return None;
    }
    Some(&frame[FRAME_HEADER_LEN..])
}

/// Packet I/O seam consumed by the event loop and the relay.
pub trait Tunnel {
    /// Add the tunnel descriptor to the readiness set.
    fn register_readable(&self, set: &mut ReadSet) -> RawFd;

    /// Read one frame if the descriptor is ready. `Ok(None)` when not ready
    /// or when the frame was not IPv6 (silently dropped).
    fn receive_packet(&self, set: &ReadSet) -> Result<Option<BytesMut>>;

    /// Frame and write one IPv6 packet in a single write.
    fn send_packet(&self, packet: &[u8]) -> Result<()>;
}

/// Interface state seam consumed by the privileged helper.
pub trait TunConfigure {
    fn set_state(&self, up: bool) -> Result<()>;
    fn set_address(&self, addr: &Ipv6Addr, prefix_len: u8) -> Result<()>;
    fn remove_address(&self, addr: &Ipv6Addr, prefix_len: u8) -> Result<()>;
    fn add_route(&self, dest: &Ipv6Addr, prefix_len: u8) -> Result<()>;
    fn remove_route(&self, dest: &Ipv6Addr, prefix_len: u8) -> Result<()>;
    fn set_mtu(&self, mtu: u32) -> Result<()>;
}

/// An owned TUN interface.
///
/// While the handle lives, exactly one kernel interface with its name
/// exists; closing the descriptor removes the interface.
pub struct TunDevice {
    fd: OwnedFd,
    name: String,
}

impl TunDevice {
    /// Open the tunneling driver and create an L3 interface, optionally
    /// with the requested name. The kernel may assign a different name;
    /// the actual one is recorded.
    pub fn open(requested_name: Option<&str>) -> Result<Self> {
        let fd = unsafe { libc::open(TUN_DEVICE.as_ptr() as *const c_char, libc::O_RDWR) };
        if fd < 0 {
            return Err(Error::last_os("Tunneling driver error (/dev/net/tun)"));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut ifr = IfReqFlags {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TUN,
            _pad: [0; 22],
        };
        if let Some(name) = requested_name {
            copy_name(&mut ifr.ifr_name, name);
        }

        if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut ifr as *mut _ as *mut c_void) }
            < 0
        {
            return Err(Error::last_os("Tunnel error (TUNSETIFF)"));
        }

        let name = unsafe { CStr::from_ptr(ifr.ifr_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        info!("Tunneling interface {} created", name);
        Ok(Self { fd, name })
    }

    /// The interface name actually assigned by the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw descriptor, for max-fd computation.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Kernel's integer index for this interface.
    fn ifindex(&self, sock: &OwnedFd) -> Result<c_int> {
        let mut ifr = IfReqIndex {
            ifr_name: [0; IFNAMSIZ],
            ifr_ifindex: 0,
            _pad: [0; 20],
        };
        copy_name(&mut ifr.ifr_name, &self.name);

        if unsafe {
            libc::ioctl(sock.as_raw_fd(), SIOCGIFINDEX as _, &mut ifr as *mut _ as *mut c_void)
        } < 0
        {
            return Err(Error::last_os("Tunnel error (SIOCGIFINDEX)"));
        }
        Ok(ifr.ifr_ifindex)
    }

    fn state_ioctl(&self, up: bool) -> Result<()> {
        let sock = control_socket()?;

        let mut ifr = IfReqFlags {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: 0,
            _pad: [0; 22],
        };
        copy_name(&mut ifr.ifr_name, &self.name);

        if unsafe {
            libc::ioctl(sock.as_raw_fd(), SIOCGIFFLAGS as _, &mut ifr as *mut _ as *mut c_void)
        } < 0
        {
            return Err(Error::last_os("Tunnel error (SIOCGIFFLAGS)"));
        }

        ifr.ifr_flags |= IFF_POINTOPOINT | IFF_NOARP;
        ifr.ifr_flags &= !(IFF_MULTICAST | IFF_BROADCAST);
        if up {
            ifr.ifr_flags |= IFF_UP | IFF_RUNNING;
        } else {
            ifr.ifr_flags &= !(IFF_UP | IFF_RUNNING);
        }

        if unsafe {
            libc::ioctl(sock.as_raw_fd(), SIOCSIFFLAGS as _, &mut ifr as *mut _ as *mut c_void)
        } < 0
        {
            return Err(Error::last_os(format!(
                "{} tunnel error (SIOCSIFFLAGS)",
                self.name
            )));
        }

        debug!("Interface {} {}", self.name, if up { "up" } else { "down" });
        Ok(())
    }

    fn address_ioctl(&self, request: c_ulong, addr: &Ipv6Addr, prefix_len: u8) -> Result<()> {
        validate_prefix_len(prefix_len)?;

        let sock = control_socket()?;
        let ifindex = self.ifindex(&sock)?;

        let mut req = In6Ifreq {
            ifr6_addr: addr.octets(),
            ifr6_prefixlen: prefix_len as u32,
            ifr6_ifindex: ifindex,
        };

        if unsafe { libc::ioctl(sock.as_raw_fd(), request as _, &mut req as *mut _ as *mut c_void) }
            < 0
        {
            return Err(Error::last_os(format!(
                "{} tunnel address error",
                self.name
            )));
        }

        debug!("{} tunnel address {}/{} updated", self.name, addr, prefix_len);
        Ok(())
    }

    fn route_ioctl(&self, request: c_ulong, dest: &Ipv6Addr, prefix_len: u8) -> Result<()> {
        validate_prefix_len(prefix_len)?;

        let sock = control_socket()?;
        let ifindex = self.ifindex(&sock)?;

        let mut req = In6Rtmsg {
            rtmsg_dst: dest.octets(),
            rtmsg_src: [0; 16],
            rtmsg_gateway: [0; 16],
            rtmsg_type: 0,
            rtmsg_dst_len: prefix_len as u16,
            rtmsg_src_len: 0,
            rtmsg_metric: 1,
            rtmsg_info: 0,
            rtmsg_flags: RTF_UP,
            rtmsg_ifindex: ifindex,
        };

        if unsafe { libc::ioctl(sock.as_raw_fd(), request as _, &mut req as *mut _ as *mut c_void) }
            < 0
        {
            return Err(Error::last_os(format!("{} tunnel route error", self.name)));
        }

        debug!("{} tunnel route {}/{} updated", self.name, dest, prefix_len);
        Ok(())
    }
}

impl TunConfigure for TunDevice {
    /// Bring the interface up or down.
    ///
    /// The tunnel is always point-to-point and ARP-less, and never
    /// multicast or broadcast capable; those bits are (re)asserted on
    /// every state change.
    fn set_state(&self, up: bool) -> Result<()> {
        self.state_ioctl(up)
    }

    fn set_address(&self, addr: &Ipv6Addr, prefix_len: u8) -> Result<()> {
        self.address_ioctl(SIOCSIFADDR, addr, prefix_len)
    }

    fn remove_address(&self, addr: &Ipv6Addr, prefix_len: u8) -> Result<()> {
        self.address_ioctl(SIOCDIFADDR, addr, prefix_len)
    }

    fn add_route(&self, dest: &Ipv6Addr, prefix_len: u8) -> Result<()> {
        self.route_ioctl(SIOCADDRT, dest, prefix_len)
    }

    fn remove_route(&self, dest: &Ipv6Addr, prefix_len: u8) -> Result<()> {
        self.route_ioctl(SIOCDELRT, dest, prefix_len)
    }

    fn set_mtu(&self, mtu: u32) -> Result<()> {
        validate_mtu(mtu)?;

        let sock = control_socket()?;

        let mut ifr = IfReqMtu {
            ifr_name: [0; IFNAMSIZ],
            ifr_mtu: mtu as c_int,
            _pad: [0; 20],
        };
        copy_name(&mut ifr.ifr_name, &self.name);

        if unsafe {
            libc::ioctl(sock.as_raw_fd(), SIOCSIFMTU as _, &mut ifr as *mut _ as *mut c_void)
        } < 0
        {
            return Err(Error::last_os(format!(
                "{} tunnel MTU error (SIOCSIFMTU)",
                self.name
            )));
        }

        debug!("{} tunnel MTU set to {}", self.name, mtu);
        Ok(())
    }
}

impl Tunnel for TunDevice {
    fn register_readable(&self, set: &mut ReadSet) -> RawFd {
        set.register(self.fd.as_raw_fd())
    }

    fn receive_packet(&self, set: &ReadSet) -> Result<Option<BytesMut>> {
        if !set.contains(self.fd.as_raw_fd()) {
            return Ok(None);
        }

        let mut buf = [0u8; MAX_PACKET + FRAME_HEADER_LEN];
        let len = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
            )
        };
        if len < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        match unframe_packet(&buf[..len as usize]) {
            Some(packet) => Ok(Some(BytesMut::from(packet))),
            None => {
                debug!("{}: dropping non-IPv6 frame", self.name);
                Ok(None)
            }
        }
    }

    fn send_packet(&self, packet: &[u8]) -> Result<()> {
        let frame = frame_packet(packet)?;

        let written = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const c_void,
                frame.len(),
            )
        };
        if written < 0 {
            let e = std::io::Error::last_os_error();
            warn!("Cannot send packet to tunnel: {}", e);
            return Err(e.into());
        }
        if written as usize != frame.len() {
            warn!("Packet truncated to {} octet(s)", written);
            return Err(Error::tun(format!("short write: {written} octets")));
        }
        Ok(())
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        info!("Tunneling interface {} removed", self.name);
    }
}

/// PF_INET6 datagram socket for interface ioctls; any such socket will do.
fn control_socket() -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::PF_INET6, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(Error::last_os("IPv6 stack not available"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// NUL-terminated copy of an interface name into an ioctl buffer.
fn copy_name(target: &mut [c_char; IFNAMSIZ], name: &str) {
    for (i, byte) in name.bytes().take(IFNAMSIZ - 1).enumerate() {
        target[i] = byte as c_char;
    }
}
