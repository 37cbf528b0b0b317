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

//! usb-port-guardianctl
//!
//! Command-line tool to read port status from, and send restart/enable/
//! disable commands to, a running `usb-port-guardiand` over its control
//! socket.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

fn main() -> Result<()> {
    let args = Cli::parse();

    let response = if let Some(path) = &args.restart {
        send_command(&args.socket, path, 0)?
    } else if let Some(path) = &args.enable {
        send_command(&args.socket, path, 1)?
    } else if let Some(path) = &args.disable {
        send_command(&args.socket, path, 2)?
    } else {
        get_status(&args.socket)?
    };

    println!("{response}");
    Ok(())
}

fn get_status(socket_path: &PathBuf) -> Result<String> {
    let mut socket = UnixStream::connect(socket_path)
        .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
    socket
        .write_all(b"GET / HTTP/1.0\r\nConnection: close\r\n\r\n")
        .context("failed to send GET request")?;
    read_body(socket)
}

fn send_command(socket_path: &PathBuf, path: &str, cmd: u8) -> Result<String> {
    let body = format!(r#"{{"ports":[{{"path":"{path}","cmd":{cmd}}}]}}"#);
    let mut socket = UnixStream::connect(socket_path)
        .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
    let request = format!(
        "POST / HTTP/1.0\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    socket.write_all(request.as_bytes()).context("failed to send POST request")?;
    read_body(socket)
}

/// Reads the whole reply and strips the header, leaving just the JSON body
/// (or an empty string for a bodyless error reply).
fn read_body(mut socket: UnixStream) -> Result<String> {
    let mut raw = String::new();
    socket.read_to_string(&mut raw).context("failed to read reply")?;
    Ok(match raw.split_once("\r\n\r\n") {
        Some((_, body)) => body.to_string(),
        None => raw,
    })
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = "Control client for usb-port-guardiand",
    long_about = None
)]
struct Cli {
    /// Path to the control socket `usb-port-guardiand` listens on.
    #[arg(long, value_name = "PATH", default_value = "/var/run/usb-port-guardiand.sock")]
    socket: PathBuf,

    /// Restart the port at this topology path (e.g. "2-1-4").
    #[arg(long, value_name = "PATH", conflicts_with_all = ["enable", "disable"])]
    restart: Option<String>,

    /// Enable (power on) the port at this topology path.
    #[arg(long, value_name = "PATH", conflicts_with_all = ["restart", "disable"])]
    enable: Option<String>,

    /// Disable (power off) the port at this topology path.
    #[arg(long, value_name = "PATH", conflicts_with_all = ["restart", "enable"])]
    disable: Option<String>,
}
