//! The forking supervisor.
//!
//! Runs in a loop of generations: install the signal bridge, (re)parse the
//! configuration, fork a worker, wait for it, and decide whether to exit,
//! reload, or restart after a crash. Configuration reload is nothing more
//! than parsing again on the next generation.

use std::path::PathBuf;

use tracing::{error, info};

use crate::config::{MiredoConfig, WorkerConfig};
use crate::signal::{self, SignalBridge};
use crate::worker;

/// What to do once a generation's worker has been reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave the loop with this process exit code.
    Exit(i32),
    /// Start the next generation (reload or crash-restart).
    Reload,
}

/// Settings resolved by the command line, stable across generations.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Configuration file, re-read every generation.
    pub config_path: PathBuf,
    /// Uid the worker drops to.
    pub uid: libc::uid_t,
    /// Optional chroot directory for the worker.
    pub chroot_dir: Option<PathBuf>,
}

/// Decide the next step from the signal state and the worker's status.
/// Priority: exit > reload > child status; a child killed by a signal it
/// did not ask for is treated as a crash and restarted.
pub fn decide(should_exit: i32, should_reload: i32, status: libc::c_int) -> Decision {
    if should_exit != 0 {
        info!("Exiting on signal {}", should_exit);
        return Decision::Exit(0);
    }
    if should_reload != 0 {
        info!("Reloading configuration on signal {}", should_reload);
        return Decision::Reload;
    }
    if libc::WIFEXITED(status) {
        let code = libc::WEXITSTATUS(status);
        info!("Terminated (exit code: {})", code);
        return Decision::Exit(code);
    }
    if libc::WIFSIGNALED(status) {
        info!("Child killed by signal {}", libc::WTERMSIG(status));
    }
    Decision::Reload
}

/// Run generations until a terminal signal or a worker failure. Returns
/// the process exit code.
pub fn run(opts: &SupervisorOptions) -> i32 {
    let mut facility: Option<String> = None;

    loop {
        let bridge = match SignalBridge::install() {
            Ok(bridge) => bridge,
            Err(e) => {
                error!("{}", e);
                return 1;
            }
        };

        let config = match MiredoConfig::from_file(&opts.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("Loading configuration from {} failed: {:#}", opts.config_path.display(), e);
                return 1;
            }
        };

        if config.syslog_facility != facility {
            // The subscriber owns the actual log transport; record the
            // request so operators can see it took effect.
            if let Some(new) = &config.syslog_facility {
                info!("Log facility set to {}", new);
            }
            facility = config.syslog_facility.clone();
        }

        let worker_config = WorkerConfig::from_config(&config, opts.uid, opts.chroot_dir.clone());

        // SAFETY: the supervisor is single-threaded; the child only runs
        // the worker and then exits.
        let pid = unsafe { libc::fork() };
        if pid == -1 {
            error!("fork failed: {}", std::io::Error::last_os_error());
            return 1;
        }
        if pid == 0 {
            // The worker keeps the read end in its readiness set but must
            // never write to the bridge itself.
            signal::close_write_end();
            let retval = worker::run(&worker_config, bridge.reader());
            std::process::exit(-retval);
        }

        let mut status: libc::c_int = 0;
        while unsafe { libc::waitpid(pid, &mut status, 0) } == -1 {
            // Interrupted by one of our own signals; keep waiting for the
            // worker, which saw the same signal through the bridge.
            if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                break;
            }
        }

        // Closes the write end first, then the read end.
        drop(bridge);

        match decide(signal::should_exit(), signal::should_reload(), status) {
            Decision::Exit(code) => return code,
            Decision::Reload => continue,
        }
    }
}
