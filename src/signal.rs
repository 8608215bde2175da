//! Self-pipe signal bridge.
//!
//! `select(2)` cannot be interrupted reliably from a Linux signal handler,
//! so handlers write the signal number into a pipe whose read end sits in
//! the readiness set. The handlers may run as root or not, in the
//! supervisor or (inherited) in the worker; they only touch the two atomic
//! flags and the pipe write descriptor, all async-signal-safe.
//!
//! Once the write end is closed, the handlers become no-ops; each flag is
//! set at most once per generation.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, c_void};
use tracing::debug;

use crate::error::{Error, Result};

/// Terminal signal observed this generation (0 = none).
static SHOULD_EXIT: AtomicI32 = AtomicI32::new(0);

/// Reload signal observed this generation (0 = none).
static SHOULD_RELOAD: AtomicI32 = AtomicI32::new(0);

/// Write end of the bridge pipe; -1 turns the handlers into no-ops.
static SIGNAL_WFD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn exit_handler(signum: c_int) {
    if SHOULD_EXIT.load(Ordering::Relaxed) != 0 {
        return;
    }
    let fd = SIGNAL_WFD.load(Ordering::Relaxed);
    if fd == -1 {
        return;
    }

    unsafe {
        libc::write(fd, &signum as *const c_int as *const c_void, 4);
    }
    SHOULD_EXIT.store(signum, Ordering::Relaxed);
}

extern "C" fn reload_handler(signum: c_int) {
    if SHOULD_RELOAD.load(Ordering::Relaxed) != 0 {
        return;
    }
    let fd = SIGNAL_WFD.load(Ordering::Relaxed);
    if fd == -1 {
        return;
    }

    unsafe {
        libc::write(fd, &signum as *const c_int as *const c_void, 4);
    }
    SHOULD_RELOAD.store(signum, Ordering::Relaxed);
}

/// The read end of the bridge plus the installed handlers.
///
/// Dropping the bridge closes the write end first, so a handler racing the
/// teardown never writes into a closed pipe, then releases the read end.
pub struct SignalBridge {
    read_fd: OwnedFd,
}

impl SignalBridge {
    /// Create the pipe, reset the per-generation state and install the
    /// handlers: INT/QUIT/TERM request exit, HUP requests reload,
    /// PIPE/USR1/USR2 are ignored (write errors are checked inline
    /// instead of through SIGPIPE).
    pub fn install() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(Error::last_os("pipe failed"));
        }

        SHOULD_EXIT.store(0, Ordering::Relaxed);
        SHOULD_RELOAD.store(0, Ordering::Relaxed);
        SIGNAL_WFD.store(fds[1], Ordering::Relaxed);

        set_handler(libc::SIGINT, exit_handler as libc::sighandler_t)?;
        set_handler(libc::SIGQUIT, exit_handler as libc::sighandler_t)?;
        set_handler(libc::SIGTERM, exit_handler as libc::sighandler_t)?;

        set_handler(libc::SIGPIPE, libc::SIG_IGN)?;
        set_handler(libc::SIGUSR1, libc::SIG_IGN)?;
        set_handler(libc::SIGUSR2, libc::SIG_IGN)?;

        set_handler(libc::SIGHUP, reload_handler as libc::sighandler_t)?;

        Ok(Self {
            read_fd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
        })
    }

    /// Descriptor for the readiness set.
    pub fn reader(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.read_fd.as_raw_fd()
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        close_write_end();
        // The read end closes with the OwnedFd, after the write end is
        // gone, so a late signal cannot raise SIGPIPE against us.
        debug!("signal bridge torn down");
    }
}

/// Disarm the handlers and close the bridge write end.
///
/// Called from the worker child right after the fork: the pipe object
/// stays alive through the supervisor's descriptors, but this process's
/// handlers stop writing to it.
pub fn close_write_end() {
    let fd = SIGNAL_WFD.swap(-1, Ordering::Relaxed);
    if fd != -1 {
        unsafe { libc::close(fd) };
    }
}

/// Terminal signal number recorded this generation, or 0.
pub fn should_exit() -> i32 {
    SHOULD_EXIT.load(Ordering::Relaxed)
}

/// Reload signal number recorded this generation, or 0.
pub fn should_reload() -> i32 {
    SHOULD_RELOAD.load(Ordering::Relaxed)
}

fn set_handler(signum: c_int, handler: libc::sighandler_t) -> Result<()> {
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe { libc::sigemptyset(&mut sa.sa_mask) };
    sa.sa_sigaction = handler;
    sa.sa_flags = 0;

    if unsafe { libc::sigaction(signum, &sa, std::ptr::null_mut()) } < 0 {
        return Err(Error::last_os(format!("sigaction({signum}) failed")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    /// The handlers and the per-generation state share process globals, so
    /// the whole lifecycle is exercised in a single sequential test.
    #[test]
    fn test_handler_lifecycle() {
        let (tx, mut rx) = UnixStream::pair().unwrap();
        rx.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

        SHOULD_EXIT.store(0, Ordering::Relaxed);
        SHOULD_RELOAD.store(0, Ordering::Relaxed);
        SIGNAL_WFD.store(tx.into_raw_fd(), Ordering::Relaxed);

        // First terminal signal: 4 octets written, number recorded.
        exit_handler(libc::SIGTERM);
        assert_eq!(should_exit(), libc::SIGTERM);
        let mut buf = [0u8; 4];
        rx.read_exact(&mut buf).unwrap();
        assert_eq!(i32::from_ne_bytes(buf), libc::SIGTERM);

        // Second terminal signal of the generation is dropped.
        exit_handler(libc::SIGINT);
        assert_eq!(should_exit(), libc::SIGTERM);

        // Reload is tracked independently.
        reload_handler(libc::SIGHUP);
        assert_eq!(should_reload(), libc::SIGHUP);
        rx.read_exact(&mut buf).unwrap();
        assert_eq!(i32::from_ne_bytes(buf), libc::SIGHUP);
        reload_handler(libc::SIGHUP);
        assert_eq!(should_reload(), libc::SIGHUP);

        // After the write end is gone the handlers are no-ops.
        SHOULD_EXIT.store(0, Ordering::Relaxed);
        SHOULD_RELOAD.store(0, Ordering::Relaxed);
        close_write_end();
        exit_handler(libc::SIGTERM);
        reload_handler(libc::SIGHUP);
        assert_eq!(should_exit(), 0);
        assert_eq!(should_reload(), 0);
    }
}
