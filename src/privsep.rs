//! Privilege separation for the Teredo client.
//!
//! The client reconfigures the tunnel whenever the server hands out a new
//! mapped address, long after the worker dropped privileges. A helper
//! process forked before `setuid` keeps the capability and applies typed
//! requests received over an inherited stream socket.
//!
//! ## Request format
//! ```text
//! +--------+------------------+------------+        +--------+
//! | opcode | IPv6 address     | prefix len |   or   | opcode | MTU |
//! | 1B     | 16B              | 1B         |        | 1B     | 2B  |
//! +--------+------------------+------------+        +--------+-----+
//! ```
//! Every request is answered with one status octet (0 = applied). The
//! helper never reads anything but these fixed-size records, performs no
//! network I/O, and executes nothing; it exits once the worker closes its
//! end, undoing the address and routes it installed.

use std::io::{Read, Write};
use std::net::Ipv6Addr;
use std::os::unix::net::UnixStream;
use std::process;

use bytes::{BufMut, BytesMut};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::tun::TunConfigure;

const OP_SET_ADDRESS: u8 = 1;
const OP_REMOVE_ADDRESS: u8 = 2;
const OP_ADD_ROUTE: u8 = 3;
const OP_REMOVE_ROUTE: u8 = 4;
const OP_SET_MTU: u8 = 5;

const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

/// A request the worker may delegate to the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivRequest {
    SetAddress { addr: Ipv6Addr, prefix_len: u8 },
    RemoveAddress { addr: Ipv6Addr, prefix_len: u8 },
    AddRoute { dest: Ipv6Addr, prefix_len: u8 },
    RemoveRoute { dest: Ipv6Addr, prefix_len: u8 },
    SetMtu { mtu: u16 },
}

impl PrivRequest {
    fn encode(&self, buf: &mut BytesMut) {
        match *self {
            PrivRequest::SetAddress { addr, prefix_len } => {
                buf.put_u8(OP_SET_ADDRESS);
                buf.put_slice(&addr.octets());
                buf.put_u8(prefix_len);
            }
            PrivRequest::RemoveAddress { addr, prefix_len } => {
                buf.put_u8(OP_REMOVE_ADDRESS);
                buf.put_slice(&addr.octets());
                buf.put_u8(prefix_len);
            }
            PrivRequest::AddRoute { dest, prefix_len } => {
                buf.put_u8(OP_ADD_ROUTE);
                buf.put_slice(&dest.octets());
                buf.put_u8(prefix_len);
            }
            PrivRequest::RemoveRoute { dest, prefix_len } => {
                buf.put_u8(OP_REMOVE_ROUTE);
                buf.put_slice(&dest.octets());
                buf.put_u8(prefix_len);
            }
            PrivRequest::SetMtu { mtu } => {
                buf.put_u8(OP_SET_MTU);
                buf.put_u16(mtu);
            }
        }
    }
}

/// Read one request off the stream; `None` on clean EOF.
fn read_request(reader: &mut impl Read) -> std::io::Result<Option<PrivRequest>> {
    let mut opcode = [0u8; 1];
    if reader.read(&mut opcode)? == 0 {
        return Ok(None);
    }

    let request = match opcode[0] {
        OP_SET_MTU => {
            let mut body = [0u8; 2];
            reader.read_exact(&mut body)?;
            PrivRequest::SetMtu {
                mtu: u16::from_be_bytes(body),
            }
        }
        op @ (OP_SET_ADDRESS | OP_REMOVE_ADDRESS | OP_ADD_ROUTE | OP_REMOVE_ROUTE) => {
            let mut body = [0u8; 17];
            reader.read_exact(&mut body)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[0..16]);
            let addr = Ipv6Addr::from(octets);
            let prefix_len = body[16];
            match op {
                OP_SET_ADDRESS => PrivRequest::SetAddress { addr, prefix_len },
                OP_REMOVE_ADDRESS => PrivRequest::RemoveAddress { addr, prefix_len },
                OP_ADD_ROUTE => PrivRequest::AddRoute { dest: addr, prefix_len },
                _ => PrivRequest::RemoveRoute { dest: addr, prefix_len },
            }
        }
        op => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown privsep opcode {op}"),
            ))
        }
    };

    Ok(Some(request))
}

/// Send one request and wait for the helper's status octet.
pub fn send_request(stream: &mut UnixStream, request: &PrivRequest) -> Result<()> {
    let mut buf = BytesMut::with_capacity(18);
    request.encode(&mut buf);
    stream
        .write_all(&buf)
        .map_err(|e| Error::PrivSep(format!("request write failed: {e}")))?;

    let mut status = [0u8; 1];
    stream
        .read_exact(&mut status)
        .map_err(|e| Error::PrivSep(format!("status read failed: {e}")))?;

    if status[0] != STATUS_OK {
        return Err(Error::HelperRejected);
    }
    Ok(())
}

/// Worker-side handle on the privileged helper.
pub struct PrivChannel {
    stream: UnixStream,
    helper_pid: libc::pid_t,
}

impl PrivChannel {
    /// Wrap an already-connected stream whose far end is served in-process
    /// (no helper child to reap).
    #[cfg(test)]
    pub(crate) fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            helper_pid: 0,
        }
    }

    pub fn helper_pid(&self) -> libc::pid_t {
        self.helper_pid
    }

    pub fn set_address(&mut self, addr: Ipv6Addr, prefix_len: u8) -> Result<()> {
        send_request(&mut self.stream, &PrivRequest::SetAddress { addr, prefix_len })
    }

    pub fn remove_address(&mut self, addr: Ipv6Addr, prefix_len: u8) -> Result<()> {
        send_request(
            &mut self.stream,
            &PrivRequest::RemoveAddress { addr, prefix_len },
        )
    }

    pub fn add_route(&mut self, dest: Ipv6Addr, prefix_len: u8) -> Result<()> {
        send_request(&mut self.stream, &PrivRequest::AddRoute { dest, prefix_len })
    }

    pub fn remove_route(&mut self, dest: Ipv6Addr, prefix_len: u8) -> Result<()> {
        send_request(&mut self.stream, &PrivRequest::RemoveRoute { dest, prefix_len })
    }

    pub fn set_mtu(&mut self, mtu: u16) -> Result<()> {
        send_request(&mut self.stream, &PrivRequest::SetMtu { mtu })
    }
}

/// Fork the privileged helper. The parent (worker) gets the channel; the
/// child applies requests against its inherited copy of the tunnel and
/// never returns.
pub fn fork_helper(device: &dyn TunConfigure) -> Result<PrivChannel> {
    let (worker_sock, helper_sock) = UnixStream::pair()
        .map_err(|e| Error::PrivSep(format!("socketpair failed: {e}")))?;

    // SAFETY: the worker is still single-threaded at this point; the child
    // only touches its own copies of the descriptors.
    match unsafe { libc::fork() } {
        -1 => Err(Error::PrivSep(format!(
            "fork failed: {}",
            std::io::Error::last_os_error()
        ))),
        0 => {
            drop(worker_sock);
            let code = helper_loop(helper_sock, device);
            process::exit(code);
        }
        pid => {
            drop(helper_sock);
            Ok(PrivChannel {
                stream: worker_sock,
                helper_pid: pid,
            })
        }
    }
}

/// Serve requests until the worker closes the channel, then undo whatever
/// interface state this helper installed. Runs in the helper process (or,
/// in tests, on a plain thread).
pub fn helper_loop(mut stream: UnixStream, device: &dyn TunConfigure) -> i32 {
    let mut installed_addr: Option<(Ipv6Addr, u8)> = None;
    let mut installed_routes: Vec<(Ipv6Addr, u8)> = Vec::new();
    let mut brought_up = false;

    info!("privileged helper running");

    loop {
        let request = match read_request(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!("privileged helper read error: {}", e);
                break;
            }
        };

        let outcome = match request {
            PrivRequest::SetAddress { addr, prefix_len } => {
                // An address assignment implies a usable interface; the
                // kernel refuses the address on a downed tunnel anyway.
                let r = if brought_up {
                    Ok(())
                } else {
                    device.set_state(true)
                }
                .and_then(|()| device.set_address(&addr, prefix_len));
                if r.is_ok() {
                    brought_up = true;
                    installed_addr = Some((addr, prefix_len));
                }
                r
            }
            PrivRequest::RemoveAddress { addr, prefix_len } => {
                let r = device.remove_address(&addr, prefix_len);
                if installed_addr == Some((addr, prefix_len)) {
                    installed_addr = None;
                }
                r
            }
            PrivRequest::AddRoute { dest, prefix_len } => {
                let r = device.add_route(&dest, prefix_len);
                if r.is_ok() {
                    installed_routes.push((dest, prefix_len));
                }
                r
            }
            PrivRequest::RemoveRoute { dest, prefix_len } => {
                let r = device.remove_route(&dest, prefix_len);
                installed_routes.retain(|entry| *entry != (dest, prefix_len));
                r
            }
            PrivRequest::SetMtu { mtu } => device.set_mtu(mtu as u32),
        };

        let status = match outcome {
            Ok(()) => STATUS_OK,
            Err(e) => {
                warn!("privileged helper request failed: {}", e);
                STATUS_ERR
            }
        };

        if stream.write_all(&[status]).is_err() {
            break;
        }
    }

    // The worker is gone; roll back the state it asked for.
    for (dest, prefix_len) in installed_routes.iter().rev() {
        if let Err(e) = device.remove_route(dest, *prefix_len) {
            debug!("route cleanup failed: {}", e);
        }
    }
    if let Some((addr, prefix_len)) = installed_addr {
        if let Err(e) = device.remove_address(&addr, prefix_len) {
            debug!("address cleanup failed: {}", e);
        }
    }
    if brought_up {
        if let Err(e) = device.set_state(false) {
            debug!("interface shutdown failed: {}", e);
        }
    }

    info!("privileged helper exiting");
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingDevice {
        ops: Arc<Mutex<Vec<String>>>,
        fail_routes: bool,
    }

    impl TunConfigure for RecordingDevice {
        fn set_state(&self, up: bool) -> Result<()> {
            self.ops
                .lock()
                .unwrap()
                .push(format!("set_state {up}"));
            Ok(())
        }

        fn set_address(&self, addr: &Ipv6Addr, prefix_len: u8) -> Result<()> {
            self.ops
                .lock()
                .unwrap()
                .push(format!("set_address {addr}/{prefix_len}"));
            Ok(())
        }

        fn remove_address(&self, addr: &Ipv6Addr, prefix_len: u8) -> Result<()> {
            self.ops
                .lock()
                .unwrap()
                .push(format!("remove_address {addr}/{prefix_len}"));
            Ok(())
        }

        fn add_route(&self, dest: &Ipv6Addr, prefix_len: u8) -> Result<()> {
            if self.fail_routes {
                return Err(Error::tun("route rejected"));
            }
            self.ops
                .lock()
                .unwrap()
                .push(format!("add_route {dest}/{prefix_len}"));
            Ok(())
        }

        fn remove_route(&self, dest: &Ipv6Addr, prefix_len: u8) -> Result<()> {
            self.ops
                .lock()
                .unwrap()
                .push(format!("remove_route {dest}/{prefix_len}"));
            Ok(())
        }

        fn set_mtu(&self, mtu: u32) -> Result<()> {
            self.ops.lock().unwrap().push(format!("set_mtu {mtu}"));
            Ok(())
        }
    }

    fn roundtrip(request: PrivRequest) -> PrivRequest {
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        read_request(&mut Cursor::new(buf.to_vec()))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_codec_roundtrip() {
        let addr: Ipv6Addr = "2001:0:203:405::1".parse().unwrap();

        for request in [
            PrivRequest::SetAddress { addr, prefix_len: 32 },
            PrivRequest::RemoveAddress { addr, prefix_len: 128 },
            PrivRequest::AddRoute { dest: addr, prefix_len: 0 },
            PrivRequest::RemoveRoute { dest: addr, prefix_len: 64 },
            PrivRequest::SetMtu { mtu: 1280 },
        ] {
            assert_eq!(roundtrip(request), request);
        }
    }

    #[test]
    fn test_decode_eof_and_garbage() {
        assert!(read_request(&mut Cursor::new(vec![])).unwrap().is_none());
        assert!(read_request(&mut Cursor::new(vec![0xffu8, 0, 0])).is_err());
        // Truncated body.
        assert!(read_request(&mut Cursor::new(vec![OP_SET_ADDRESS, 1, 2])).is_err());
    }

    #[test]
    fn test_helper_applies_and_rolls_back() {
        let (mut worker, helper) = UnixStream::pair().unwrap();
        let ops = Arc::new(Mutex::new(Vec::new()));
        let device = RecordingDevice {
            ops: ops.clone(),
            fail_routes: false,
        };

        let handle = std::thread::spawn(move || helper_loop(helper, &device));

        let addr: Ipv6Addr = "2001:0:203:405::1".parse().unwrap();
        let route: Ipv6Addr = "2001::".parse().unwrap();
        send_request(&mut worker, &PrivRequest::SetAddress { addr, prefix_len: 32 }).unwrap();
        send_request(&mut worker, &PrivRequest::AddRoute { dest: route, prefix_len: 32 }).unwrap();
        send_request(&mut worker, &PrivRequest::SetMtu { mtu: 1280 }).unwrap();

        // EOF makes the helper terminate and undo its work.
        drop(worker);
        assert_eq!(handle.join().unwrap(), 0);

        let ops = ops.lock().unwrap();
        assert_eq!(
            *ops,
            vec![
                "set_state true".to_string(),
                format!("set_address {addr}/32"),
                format!("add_route {route}/32"),
                "set_mtu 1280".to_string(),
                format!("remove_route {route}/32"),
                format!("remove_address {addr}/32"),
                "set_state false".to_string(),
            ]
        );
    }

    #[test]
    fn test_helper_reports_failure() {
        let (mut worker, helper) = UnixStream::pair().unwrap();
        let device = RecordingDevice {
            ops: Arc::new(Mutex::new(Vec::new())),
            fail_routes: true,
        };

        let handle = std::thread::spawn(move || helper_loop(helper, &device));

        let dest: Ipv6Addr = "2001::".parse().unwrap();
        let err = send_request(&mut worker, &PrivRequest::AddRoute { dest, prefix_len: 32 })
            .unwrap_err();
        assert!(matches!(err, Error::HelperRejected));

        // A failed request does not kill the helper.
        send_request(&mut worker, &PrivRequest::SetMtu { mtu: 1400 }).unwrap();

        drop(worker);
        assert_eq!(handle.join().unwrap(), 0);
    }
}
