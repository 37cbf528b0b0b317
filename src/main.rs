#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::must_use_candidate
)]
// now allow a few rules which are denied by the above's statement
#![allow(clippy::multiple_crate_versions)]
#![deny(missing_debug_implementations)]
#![deny(rustdoc::all)]

//! usb-port-guardiand: supervises externally power-switchable USB ports.

mod backends;
mod cli;
mod config;
mod error;
mod event_loop;
mod http;
mod model;
mod supervisor;
mod usb_hotplug;

use std::fs::File;
use std::io::Write as _;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use nix::fcntl::{flock, FlockArg};
use nix::sys::stat::{fchmod, Mode};
use nix::unistd::{chown, Gid};
use tokio::net::UnixListener;
use tracing::{info, Level};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::FmtSubscriber;

use cli::Cli;
use config::Config;
use supervisor::Supervisor;

fn main() -> Result<()> {
    let args = Cli::parse();

    init_logging(&args)?;

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config file {}", args.config.display()))?;

    if args.daemonize {
        nix::unistd::daemon(false, false).context("failed to daemonize")?;
    }

    // Held for the lifetime of the process: dropping it releases the
    // advisory lock, so it must outlive the runtime below.
    let _pid_lock = acquire_pid_lock(&args.pid_file)
        .context("another usb-port-guardiand instance is already running")?;

    let listener = bind_control_socket(&args.socket_path, args.gid)
        .context("failed to bind the control socket")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, run(config, listener, args.probe_gpio))
}

/// Installs the `SIGUSR1` handler and hands off to [`Supervisor::run`].
/// Both must run inside the same [`tokio::task::LocalSet`] context: the
/// hotplug watcher and the handler both use `spawn_local`.
async fn run(config: Config, listener: UnixListener, probe_gpio: Option<std::path::PathBuf>) -> Result<()> {
    supervisor::install_sigusr1_handler().context("failed to install SIGUSR1 handler")?;

    let mut supervisor = Supervisor::new(config, listener);
    if let Some(persistence_path) = probe_gpio {
        supervisor.start_gpio_probe(persistence_path);
    }
    info!("usb-port-guardiand is up");
    supervisor.run().await
}

fn init_logging(args: &Cli) -> Result<()> {
    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let writer = match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        // `-s`: no syslog crate lives in this stack, so syslog mode just
        // drops ANSI color codes and writes syslog-shaped lines to stderr.
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(args.log_file.is_none() && !args.syslog)
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global tracing subscriber")?;

    // Bridge `log`-based diagnostics (nusb's dependency tree uses `log`)
    // into the same subscriber.
    tracing_log::LogTracer::init().context("failed to bridge the log crate into tracing")?;

    Ok(())
}

/// Single-instance enforcement (`spec.md` §6): an exclusive, non-blocking
/// advisory lock on a fixed PID file. Held for the life of the process.
fn acquire_pid_lock(path: &Path) -> Result<File> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .mode(0o644)
        .open(path)
        .with_context(|| format!("failed to open PID file {}", path.display()))?;

    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
        .map_err(|_| anyhow::anyhow!("PID file {} is already locked", path.display()))?;

    file.set_len(0).context("failed to truncate PID file")?;
    (&file)
        .write_all(format!("{}\n", std::process::id()).as_bytes())
        .context("failed to write PID file")?;

    Ok(file)
}

/// Binds the control socket and applies the fixed `0660` + configurable-gid
/// permissions from `spec.md` §6, grounded in `socket_utility.c`'s
/// `socket_utility_create_unix_socket` (bind, then `chmod`, then `chown`).
fn bind_control_socket(path: &Path, gid: Option<u32>) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale control socket {}", path.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind control socket {}", path.display()))?;

    fchmod(listener.as_raw_fd(), Mode::from_bits_truncate(0o660))
        .context("failed to set control socket permissions")?;
    if let Some(gid) = gid {
        chown(path, None, Some(Gid::from_raw(gid))).context("failed to chown control socket")?;
    }

    Ok(listener)
}
