use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};

/// TCP keepalive tuning applied to every accepted and connected socket.
///
/// `None` leaves the kernel default in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveOptions {
    pub enabled: bool,
    /// Seconds of idle time before the first probe.
    pub idle: Option<u32>,
    /// Unanswered probes before the connection is dropped.
    pub count: Option<u32>,
    /// Seconds between probes.
    pub interval: Option<u32>,
}

impl Default for KeepaliveOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            idle: None,
            count: None,
            interval: None,
        }
    }
}

async fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{host} did not resolve"),
            )
        })
}

/// Bind a TCP listener with `SO_REUSEADDR` and an explicit backlog.
pub async fn bind(host: &str, port: u16, backlog: u32) -> Result<TcpListener> {
    let bind_err = |source: std::io::Error| TransportError::Bind {
        endpoint: Endpoint::tcp(host, port),
        source,
    };
    let addr = resolve(host, port).await.map_err(bind_err)?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    let listener = socket.listen(backlog).map_err(bind_err)?;
    info!(%addr, backlog, "listening on tcp");
    Ok(listener)
}

/// Connect to `host:port`, applying keepalive settings to the new stream.
pub async fn connect(host: &str, port: u16, keepalive: &KeepaliveOptions) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|source| TransportError::Connect {
            endpoint: Endpoint::tcp(host, port),
            source,
        })?;
    configure_stream(&stream, keepalive);
    debug!(host, port, "connected over tcp");
    Ok(stream)
}

/// Apply `TCP_NODELAY` and keepalive settings. Failures are logged, not fatal.
pub fn configure_stream(stream: &TcpStream, keepalive: &KeepaliveOptions) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%err, "failed to set TCP_NODELAY");
    }
    if let Err(err) = apply_keepalive(stream, keepalive) {
        warn!(%err, "failed to apply tcp keepalive options");
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const TCP_KEEPIDLE: libc::c_int = libc::TCP_KEEPIDLE;
#[cfg(target_os = "macos")]
const TCP_KEEPIDLE: libc::c_int = libc::TCP_KEEPALIVE;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
fn apply_keepalive(stream: &TcpStream, keepalive: &KeepaliveOptions) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, keepalive.enabled as libc::c_int)?;
    if !keepalive.enabled {
        return Ok(());
    }
    if let Some(idle) = keepalive.idle {
        setsockopt(fd, libc::IPPROTO_TCP, TCP_KEEPIDLE, idle as libc::c_int)?;
    }
    if let Some(count) = keepalive.count {
        setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, count as libc::c_int)?;
    }
    if let Some(interval) = keepalive.interval {
        setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, interval as libc::c_int)?;
    }
    Ok(())
}

#[cfg(all(
    unix,
    not(any(target_os = "linux", target_os = "android", target_os = "macos"))
))]
fn apply_keepalive(stream: &TcpStream, keepalive: &KeepaliveOptions) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    setsockopt(
        stream.as_raw_fd(),
        libc::SOL_SOCKET,
        libc::SO_KEEPALIVE,
        keepalive.enabled as libc::c_int,
    )
}

#[cfg(not(unix))]
fn apply_keepalive(_stream: &TcpStream, _keepalive: &KeepaliveOptions) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn setsockopt(
    fd: std::os::fd::RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> std::io::Result<()> {
    // SAFETY: `value` lives for the duration of the call and the length matches
    // its type; `fd` is an open socket owned by the caller.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
