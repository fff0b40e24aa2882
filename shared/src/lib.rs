use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub mod mux;
pub mod pipe;
pub mod tls;

/// Acknowledgement a stream handler writes once its local dial succeeded.
pub const STREAM_ACK: [u8; 3] = *b"OK\n";

/// A declaration binding a public port on the server to an address reachable
/// by the client. `local_addr` is meaningful only on the client side; the
/// server never dereferences it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_addr: String,
}

/// The record the client sends on the first stream of a fresh session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub mappings: Vec<Mapping>,
}

/// Ports are carried as `u16` everywhere, so only zero is representable and
/// invalid.
pub fn validate_port(port: u16) -> bool {
    port != 0
}

/// Parse the decimal port carried on the first line of a data stream.
pub fn parse_port(line: &str) -> Option<u16> {
    let value: u32 = line.trim().parse().ok()?;
    if value == 0 || value > u32::from(u16::MAX) {
        return None;
    }
    Some(value as u16)
}

/// Check that an address looks like `host:port` without resolving the host.
pub fn validate_local_addr(input: &str) -> Result<(), String> {
    let idx = input
        .rfind(':')
        .ok_or_else(|| "expected ':' before port".to_string())?;
    let (host, port) = (&input[..idx], &input[idx + 1..]);

    if host.is_empty() {
        return Err("missing host".to_string());
    }
    if port.is_empty() {
        return Err("missing port".to_string());
    }

    let port = port
        .parse::<u16>()
        .map_err(|err| format!("invalid port: {err}"))?;
    if port == 0 {
        return Err("invalid port: 0".to_string());
    }

    Ok(())
}

pub fn is_connection_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

/// Enable OS-level TCP keepalive on the tunnel connection. Failure is not
/// fatal; liveness is still enforced by the stream acknowledgement deadline.
pub fn set_tcp_keepalive(stream: &tokio::net::TcpStream, period: Duration) {
    let keepalive = socket2::TcpKeepalive::new().with_time(period);
    if let Err(err) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(%err, "failed to enable TCP keepalive");
    }
}

pub type DynError = Box<dyn std::error::Error + Send + Sync>;
