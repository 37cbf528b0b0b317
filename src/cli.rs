//! This module implements the CLI interface.
//!
//! Flag set is grounded in `spec.md` §6's "CLI flags" paragraph
//! (`-o/-c/-g/-d/-s`); `-h`/`--help` is synthesized by `clap` itself.

use std::path::PathBuf;

use clap::Parser;

/// Default config file path, used when `-c` is not given.
const DEFAULT_CONFIG_PATH: &str = "/etc/usb-port-guardiand.json";
/// Default control-socket path, used when `-p` is not given.
const DEFAULT_SOCKET_PATH: &str = "/var/run/usb-port-guardiand.sock";
/// Default PID-file path guarding against a second running instance.
const DEFAULT_PID_PATH: &str = "/var/run/usb-port-guardiand.pid";

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Log file to append to, instead of stderr.
    #[arg(short = 'o', long = "output")]
    pub log_file: Option<PathBuf>,

    /// Configuration file describing the handlers to manage.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Numeric gid allowed to connect to the control socket.
    #[arg(short = 'g', long = "gid")]
    pub gid: Option<u32>,

    /// Daemonize: fork into the background after setup completes.
    #[arg(short = 'd', long = "daemonize")]
    pub daemonize: bool,

    /// Send log output through syslog-formatted lines instead of plain text.
    #[arg(short = 's', long = "syslog")]
    pub syslog: bool,

    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path of the control-socket this daemon listens on.
    #[arg(long = "socket", default_value = DEFAULT_SOCKET_PATH)]
    pub socket_path: PathBuf,

    /// Path of the PID file used for single-instance enforcement.
    #[arg(long = "pid-file", default_value = DEFAULT_PID_PATH)]
    pub pid_file: PathBuf,

    /// Run the GPIO path-discovery probe once at startup, persisting the
    /// learned path-to-GPIO mapping to this file before entering normal
    /// supervision (not an original CLI flag; see DESIGN.md).
    #[arg(long = "probe-gpio", value_name = "PATH")]
    pub probe_gpio: Option<PathBuf>,
}
