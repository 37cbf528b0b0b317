//! HTTP-over-Unix-socket control surface.
//!
//! Grounded in `examples/original_source/src/usb_monitor_client.c` and
//! `http_utility.c`/`.h`: a hand-rolled, deliberately tiny HTTP/1.0 parser
//! and responder, not a general-purpose HTTP library — the original's
//! entire header-writing helper is a handful of `snprintf` calls, and this
//! module stays proportional to that. Each connection is read, parsed,
//! answered, and closed in one pass (`spec.md` §4.8: "Connection is
//! single-request (close after reply)").

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::backends::Command;
use crate::error::BackendError;
use crate::model::port::{ConnectionStatus, MsgMode};
use crate::model::path::TopologyPath;
use crate::supervisor::Supervisor;

/// `spec.md` §4.8: "up to 4 KiB request buffer, one streaming parse pass;
/// on parser error or overflow the connection closes."
const MAX_REQUEST_SIZE: usize = 4096;

/// `HTTP_OK_HEADER` from `http_utility.c`, with the teacher's `\r\n\r\n`
/// separator preserved verbatim.
const OK_HEADER: &[u8] = b"HTTP/1.0 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
    Other,
}

/// One `(port, path)` entry of a `GET`/successful-`POST` reply body,
/// mirroring `usb_monitor_client_add_paths_json`'s per-path JSON object.
#[derive(Debug, Serialize)]
struct PortStatus {
    mode: u8,
    vid: u16,
    pid: u16,
    path: String,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    ports: Vec<PortStatus>,
}

#[derive(Debug, Deserialize)]
struct PostBody {
    ports: Vec<PostEntry>,
}

#[derive(Debug, Deserialize)]
struct PostEntry {
    path: String,
    cmd: u8,
}

/// Reads one request off `stream`, dispatches it against `supervisor`, and
/// writes back exactly one reply before the connection is dropped.
pub async fn serve_client(mut stream: UnixStream, supervisor: &mut Supervisor) -> io::Result<()> {
    let request = match read_request(&mut stream).await? {
        Some(request) => request,
        None => return write_status(&mut stream, 400).await,
    };

    debug!(method = ?request.method, "HTTP control request");

    match request.method {
        Method::Get => {
            let body = status_body(supervisor);
            write_json(&mut stream, &body).await
        }
        Method::Post => match handle_post(supervisor, &request.body).await {
            Ok(body) => write_json(&mut stream, &body).await,
            Err(status) => write_status(&mut stream, status).await,
        },
        Method::Other => write_status(&mut stream, 405).await,
    }
}

struct Request {
    method: Method,
    body: Vec<u8>,
}

/// Reads the request line, headers, and (if `Content-Length` is present)
/// body, bounded to [`MAX_REQUEST_SIZE`] total. Returns `None` if the
/// buffer overflows or the head is unparsable, signalling a `400` reply.
async fn read_request(stream: &mut UnixStream) -> io::Result<Option<Request>> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() >= MAX_REQUEST_SIZE {
            return Ok(None);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let Some(request_line) = lines.next() else { return Ok(None) };
    let method = match request_line.split_whitespace().next() {
        Some("GET") => Method::Get,
        Some("POST") => Method::Post,
        _ => Method::Other,
    };

    let content_length: usize = lines
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);

    let body_start = header_end + 4; // skip the terminating "\r\n\r\n"
    if body_start + content_length > MAX_REQUEST_SIZE {
        return Ok(None);
    }
    while buf.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = buf.get(body_start..(body_start + content_length).min(buf.len())).unwrap_or(&[]).to_vec();
    Ok(Some(Request { method, body }))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn status_body(supervisor: &Supervisor) -> StatusBody {
    let ports = supervisor
        .registry()
        .iter()
        .filter(|port| port.connection_status == ConnectionStatus::DeviceConnected)
        .flat_map(|port| {
            let (vid, pid) = port.device_identity.unwrap_or((0, 0));
            port.topology_paths.iter().map(move |path| PortStatus {
                mode: mode_code(port.msg_mode),
                vid,
                pid,
                path: path.to_string(),
            })
        })
        .collect();
    StatusBody { ports }
}

/// `IDLE=0, PING=1, RESET=2, PROBE=3` in the original's `msg_mode` enum.
const fn mode_code(mode: MsgMode) -> u8 {
    match mode {
        MsgMode::Idle => 0,
        MsgMode::Ping => 1,
        MsgMode::Reset => 2,
        MsgMode::Probe => 3,
    }
}

/// `cmd` values from `usb_monitor.h`: `CMD_RESTART=0, CMD_ENABLE=1,
/// CMD_DISABLE=2`.
const fn command_from_code(code: u8) -> Option<Command> {
    match code {
        0 => Some(Command::Restart),
        1 => Some(Command::Enable),
        2 => Some(Command::Disable),
        _ => None,
    }
}

/// `usb_monitor_client_handle_post`: malformed JSON, a missing `ports`
/// array, or an out-of-range `cmd` all reply `400`; an unknown path is
/// silently skipped (the device could have vanished between the client
/// reading status and issuing its command); a Lanner-busy backend reply
/// surfaces as `503` rather than failing the whole request.
async fn handle_post(supervisor: &mut Supervisor, body: &[u8]) -> Result<StatusBody, u16> {
    if body.is_empty() {
        return Err(400);
    }
    let parsed: PostBody = serde_json::from_slice(body).map_err(|_| 400)?;

    for entry in parsed.ports {
        let Some(cmd) = command_from_code(entry.cmd) else { return Err(400) };
        let Ok(path) = entry.path.parse::<TopologyPath>() else { continue };
        let Some(port_id) = supervisor.registry().find_by_path(&path).map(|p| p.id) else { continue };

        match supervisor.dispatch_command(port_id, cmd).await {
            Ok(()) | Err(BackendError::Rejected) => {}
            Err(BackendError::Busy) => return Err(503),
        }
    }

    Ok(status_body(supervisor))
}

async fn write_json(stream: &mut UnixStream, body: &StatusBody) -> io::Result<()> {
    let json = serde_json::to_vec(body).map_err(|_| io::Error::other("failed to build JSON reply"))?;
    stream.write_all(OK_HEADER).await?;
    stream.write_all(&json).await?;
    stream.shutdown().await
}

/// `HTTP_REPLY_ERROR` from `http_utility.c`: a bodyless status line.
async fn write_status(stream: &mut UnixStream, code: u16) -> io::Result<()> {
    let reason = match code {
        400 => "Bad Request",
        405 => "Method Not Allowed",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    };
    let line = format!("HTTP/1.0 {code} {reason}\r\nConnection: close\r\n\r\n");
    stream.write_all(line.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_codes_match_original_enum_order() {
        assert_eq!(mode_code(MsgMode::Idle), 0);
        assert_eq!(mode_code(MsgMode::Ping), 1);
        assert_eq!(mode_code(MsgMode::Reset), 2);
        assert_eq!(mode_code(MsgMode::Probe), 3);
    }

    #[test]
    fn command_codes_match_original_enum_order() {
        assert_eq!(command_from_code(0), Some(Command::Restart));
        assert_eq!(command_from_code(1), Some(Command::Enable));
        assert_eq!(command_from_code(2), Some(Command::Disable));
        assert_eq!(command_from_code(3), None);
    }

    #[test]
    fn finds_header_terminator() {
        assert_eq!(find_header_end(b"GET / HTTP/1.0\r\n\r\n"), Some(14));
        assert_eq!(find_header_end(b"GET / HTTP/1.0\r\n"), None);
    }
}
