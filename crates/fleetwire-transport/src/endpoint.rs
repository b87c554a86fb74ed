use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::TransportError;

/// Loopback interface used for port-addressed local endpoints.
pub const LOOPBACK: &str = "127.0.0.1";

/// A concrete address a listener binds to or a client connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Filesystem-path Unix domain socket.
    Unix(PathBuf),
    /// Plain TCP.
    Tcp { host: String, port: u16 },
    /// WebSocket over TCP; frames travel as binary messages.
    WebSocket {
        host: String,
        port: u16,
        path: String,
    },
}

impl Endpoint {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn websocket(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self::WebSocket {
            host: host.into(),
            port,
            path: path.into(),
        }
    }

    /// The socket path for Unix endpoints.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Unix(path) => Some(path),
            _ => None,
        }
    }

    /// The port for network endpoints.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } | Self::WebSocket { port, .. } => Some(*port),
            Self::Unix(_) => None,
        }
    }

    /// Short transport label for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match self {
            Self::Unix(_) => "unix-domain-socket",
            Self::Tcp { .. } => "tcp",
            Self::WebSocket { .. } => "websocket",
        }
    }
}

fn fmt_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp://{}:{port}", fmt_host(host)),
            Self::WebSocket { host, port, path } => {
                write!(f, "ws://{}:{port}{path}", fmt_host(host))
            }
        }
    }
}

fn split_host_port(s: &str) -> Result<(String, u16), TransportError> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidEndpoint(format!("missing port in {s:?}")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| TransportError::InvalidEndpoint(format!("bad port in {s:?}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(TransportError::InvalidEndpoint(format!(
            "missing host in {s:?}"
        )));
    }
    Ok((host.to_string(), port))
}

impl FromStr for Endpoint {
    type Err = TransportError;

    /// Parse `unix:/path`, `tcp://host:port`, `ws://host:port/path`, or a
    /// bare filesystem path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = split_host_port(rest)?;
            return Ok(Self::Tcp { host, port });
        }
        if let Some(rest) = s.strip_prefix("ws://") {
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            let (host, port) = split_host_port(authority)?;
            return Ok(Self::WebSocket {
                host,
                port,
                path: path.to_string(),
            });
        }
        let path = s.strip_prefix("unix:").unwrap_or(s);
        if path.is_empty() || path.contains("://") {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }
        Ok(Self::Unix(PathBuf::from(path)))
    }
}

/// A local endpoint given either as a socket path or a loopback port.
///
/// Strings and paths select a Unix domain socket; integers select TCP on
/// the loopback interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalAddr {
    Path(PathBuf),
    Port(u16),
}

impl LocalAddr {
    /// Resolve to a concrete endpoint.
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::Path(path) => Endpoint::Unix(path.clone()),
            Self::Port(port) => Endpoint::tcp(LOOPBACK, *port),
        }
    }
}

impl From<u16> for LocalAddr {
    fn from(port: u16) -> Self {
        Self::Port(port)
    }
}

impl From<&str> for LocalAddr {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<String> for LocalAddr {
    fn from(path: String) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for LocalAddr {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for LocalAddr {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.endpoint().fmt(f)
    }
}
