use std::fmt;

use fleetwire_transport::{Endpoint, LocalAddr};

use crate::config::{IpcMode, TransportConfig};
use crate::error::{ChannelError, Result};

/// Network binding a channel runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Binding {
    /// TCP between hosts.
    #[default]
    Tcp,
    /// Unix domain sockets under `sock_dir`, or loopback TCP in `ipc_mode = "tcp"`.
    Ipc,
    /// WebSocket binary messages over TCP.
    WebSocket,
}

impl Binding {
    pub fn name(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ipc => "ipc",
            Self::WebSocket => "ws",
        }
    }

    /// Endpoint the request server listens on.
    pub fn request_bind(self, config: &TransportConfig) -> Endpoint {
        self.endpoint(config, &config.interface, config.ret_port, "request.ipc")
    }

    /// Endpoint request clients connect to.
    pub fn request_connect(self, config: &TransportConfig) -> Endpoint {
        self.endpoint(config, &config.master_ip, config.ret_port, "request.ipc")
    }

    /// Endpoint the publish server listens on.
    pub fn publish_bind(self, config: &TransportConfig) -> Endpoint {
        self.endpoint(config, &config.interface, config.publish_port, "publish.ipc")
    }

    /// Endpoint publish clients connect to.
    pub fn publish_connect(self, config: &TransportConfig) -> Endpoint {
        self.endpoint(config, &config.master_ip, config.publish_port, "publish.ipc")
    }

    fn endpoint(self, config: &TransportConfig, host: &str, port: u16, file: &str) -> Endpoint {
        match self {
            Self::Tcp => Endpoint::tcp(host, port),
            Self::WebSocket => Endpoint::websocket(host, port, config.ws_path.clone()),
            Self::Ipc => match config.ipc_mode {
                IpcMode::Ipc => Endpoint::unix(config.sock_dir.join(file)),
                IpcMode::Tcp => LocalAddr::Port(port).endpoint(),
            },
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Local endpoint the publish daemon pulls outbound messages from.
pub fn publish_pull_addr(config: &TransportConfig) -> LocalAddr {
    match config.ipc_mode {
        IpcMode::Ipc => LocalAddr::Path(config.sock_dir.join("publish_pull.ipc")),
        IpcMode::Tcp => LocalAddr::Port(config.tcp_publish_pull_port),
    }
}

/// Local endpoint of a worker pool.
///
/// In TCP mode each pool gets `tcp_workers_port` plus a stable offset in
/// `0..1000` derived from its name. A base port too high to fit the offset
/// is a config error.
pub fn worker_addr(config: &TransportConfig, pool: &str) -> Result<LocalAddr> {
    match config.ipc_mode {
        IpcMode::Ipc => Ok(LocalAddr::Path(
            config.sock_dir.join(format!("workers-{pool}.ipc")),
        )),
        IpcMode::Tcp if config.tcp_workers_port == 0 => Ok(LocalAddr::Port(0)),
        IpcMode::Tcp => {
            let offset = (stable_hash(pool) % WORKER_PORT_SPAN) as u16;
            config
                .tcp_workers_port
                .checked_add(offset)
                .map(LocalAddr::Port)
                .ok_or_else(|| {
                    ChannelError::Config(format!(
                        "tcp_workers_port {} leaves no room for pool {pool:?}",
                        config.tcp_workers_port
                    ))
                })
        }
    }
}

/// Ports reserved above `tcp_workers_port` for per-pool offsets.
pub(crate) const WORKER_PORT_SPAN: u64 = 1000;

/// FNV-1a, so port offsets agree across processes and builds.
fn stable_hash(name: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    name.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn config() -> TransportConfig {
        TransportConfig {
            sock_dir: PathBuf::from("/run/fleet"),
            master_ip: "10.1.2.3".into(),
            interface: "0.0.0.0".into(),
            ..TransportConfig::default()
        }
    }

    #[test]
    fn tcp_endpoints_split_bind_and_connect_hosts() {
        let config = config();
        assert_eq!(
            Binding::Tcp.request_bind(&config),
            Endpoint::tcp("0.0.0.0", 4506)
        );
        assert_eq!(
            Binding::Tcp.request_connect(&config),
            Endpoint::tcp("10.1.2.3", 4506)
        );
        assert_eq!(
            Binding::WebSocket.publish_connect(&config),
            Endpoint::websocket("10.1.2.3", 4505, "/ws")
        );
    }

    #[test]
    fn ipc_binding_follows_ipc_mode() {
        let mut config = config();
        assert_eq!(
            Binding::Ipc.publish_bind(&config),
            Endpoint::unix("/run/fleet/publish.ipc")
        );
        config.ipc_mode = IpcMode::Tcp;
        assert_eq!(
            Binding::Ipc.request_connect(&config),
            Endpoint::tcp("127.0.0.1", 4506)
        );
    }

    #[test]
    fn local_addresses() {
        let mut config = config();
        assert_eq!(
            publish_pull_addr(&config),
            LocalAddr::Path("/run/fleet/publish_pull.ipc".into())
        );
        assert_eq!(
            worker_addr(&config, "default").expect("ipc address should resolve"),
            LocalAddr::Path("/run/fleet/workers-default.ipc".into())
        );

        config.ipc_mode = IpcMode::Tcp;
        assert_eq!(publish_pull_addr(&config), LocalAddr::Port(4514));
        let LocalAddr::Port(port) = worker_addr(&config, "default").expect("port should fit")
        else {
            panic!("tcp mode should give a port");
        };
        assert!((4515..4515 + 1000).contains(&port));
        assert_eq!(
            worker_addr(&config, "default").expect("port should fit"),
            LocalAddr::Port(port)
        );
    }

    #[test]
    fn worker_port_never_wraps() {
        let mut config = config();
        config.ipc_mode = IpcMode::Tcp;
        config.tcp_workers_port = u16::MAX;
        // Every name hashes to some offset; only offset zero would still fit.
        for pool in ["default", "jobs", "events", "auth"] {
            match worker_addr(&config, pool) {
                Ok(LocalAddr::Port(port)) => assert_eq!(port, u16::MAX),
                Ok(other) => panic!("tcp mode gave {other:?}"),
                Err(err) => assert!(matches!(err, ChannelError::Config(_))),
            }
        }

        config.tcp_workers_port = u16::MAX - 999;
        for pool in ["default", "jobs", "events", "auth"] {
            let LocalAddr::Port(port) = worker_addr(&config, pool).expect("offset should fit")
            else {
                panic!("tcp mode should give a port");
            };
            assert!(port >= u16::MAX - 999);
        }
    }
}
