//! Teredo tunneling daemon CLI.

use std::ffi::CString;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use miredo::supervisor::{self, SupervisorOptions};
use miredo::DEFAULT_CONFIG_FILE;

#[derive(Parser)]
#[command(name = "miredo")]
#[command(about = "Teredo IPv6 tunneling daemon (RFC 4380)")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Unprivileged user the worker runs as
    #[arg(short, long, default_value = "nobody")]
    user: String,

    /// Directory to chroot into before dropping privileges
    #[arg(short = 't', long)]
    chroot: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing with env overrides; RUST_LOG wins over --verbose.
    let fallback = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();

    let uid = match resolve_uid(&cli.user) {
        Ok(uid) => uid,
        Err(e) => {
            eprintln!("miredo: {e:#}");
            std::process::exit(1);
        }
    };

    info!(
        "miredo starting (configuration: {})",
        cli.config.display()
    );

    let code = supervisor::run(&SupervisorOptions {
        config_path: cli.config,
        uid,
        chroot_dir: cli.chroot,
    });
    std::process::exit(code);
}

/// Look up the uid for the unprivileged user.
fn resolve_uid(name: &str) -> Result<libc::uid_t> {
    let cname = CString::new(name).context("invalid user name")?;
    // SAFETY: getpwnam returns a pointer to static storage; we copy the
    // uid out before anything else can call into the passwd machinery.
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        bail!("unknown user: {name}");
    }
    Ok(unsafe { (*pw).pw_uid })
}
