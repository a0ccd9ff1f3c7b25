//! Handshake line a plugin prints on stdout right after it starts
//!
//! Format: `<protocol-version>|<transport-kind>|<address>`, one line, e.g.
//! `1|tcp|127.0.0.1:41237` or `1|unix|/tmp/plugin-1234.sock`. A tcp address
//! is a socket address or `hostname:port`; hostnames are resolved on connect.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Protocol version this host speaks
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest plugin protocol version this host still accepts
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Longest handshake line the host is willing to read
pub const MAX_HANDSHAKE_LEN: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Unix,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Unix => "unix",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    pub transport: TransportKind,
    pub address: String,
}

impl Handshake {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            transport: TransportKind::Tcp,
            address: addr.to_string(),
        }
    }

    pub fn unix(path: &std::path::Path) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            transport: TransportKind::Unix,
            address: path.display().to_string(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&self.protocol_version)
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.protocol_version,
            self.transport.as_str(),
            self.address
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParseError(pub String);

impl fmt::Display for HandshakeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed handshake: {}", self.0)
    }
}

impl std::error::Error for HandshakeParseError {}

impl FromStr for Handshake {
    type Err = HandshakeParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(3, '|');

        let (Some(version), Some(transport), Some(address)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(HandshakeParseError(format!(
                "expected <version>|<transport>|<address>, got {line:?}"
            )));
        };

        let protocol_version = version.trim().parse::<u32>().map_err(|_| {
            HandshakeParseError(format!("protocol version {version:?} is not a number"))
        })?;

        let transport = match transport.trim() {
            "tcp" => TransportKind::Tcp,
            "unix" => TransportKind::Unix,
            other => {
                return Err(HandshakeParseError(format!(
                    "unsupported transport {other:?}"
                )));
            }
        };

        let address = address.trim();
        if address.is_empty() {
            return Err(HandshakeParseError("empty address".to_string()));
        }
        if transport == TransportKind::Tcp && !is_tcp_address(address) {
            return Err(HandshakeParseError(format!(
                "tcp address {address:?} is not host:port"
            )));
        }

        Ok(Self {
            protocol_version,
            transport,
            address: address.to_string(),
        })
    }
}

fn is_tcp_address(address: &str) -> bool {
    if address.parse::<SocketAddr>().is_ok() {
        return true;
    }

    let Some((host, port)) = address.rsplit_once(':') else {
        return false;
    };
    port.parse::<u16>().is_ok()
        && !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
