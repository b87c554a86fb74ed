use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::IpcStream;
use crate::tcp::{self, KeepaliveOptions};
#[cfg(unix)]
use crate::uds::UnixDomainSocket;
use crate::ws::WsStream;

/// Upper bound on the server side of a WebSocket upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket options applied when binding any listener.
#[derive(Debug, Clone)]
pub struct BindOptions {
    /// Pending-connection queue length for TCP-based listeners.
    pub backlog: u32,
    /// Permission bits for Unix socket files.
    pub socket_mode: u32,
    /// Keepalive settings for accepted TCP connections.
    pub keepalive: KeepaliveOptions,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            backlog: 128,
            socket_mode: 0o600,
            keepalive: KeepaliveOptions::default(),
        }
    }
}

enum ListenerInner {
    #[cfg(unix)]
    Unix(UnixDomainSocket),
    Tcp(TcpListener),
    WebSocket { listener: TcpListener, path: String },
}

/// A bound listener for any [`Endpoint`].
pub struct IpcListener {
    inner: ListenerInner,
    endpoint: Endpoint,
    keepalive: KeepaliveOptions,
}

impl IpcListener {
    /// Bind a listener. Port 0 picks an ephemeral port; the resolved endpoint
    /// is available from [`local_endpoint`](Self::local_endpoint).
    pub async fn bind(endpoint: &Endpoint, opts: &BindOptions) -> Result<Self> {
        let (inner, resolved) = match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let uds = UnixDomainSocket::bind_with_mode(path, opts.socket_mode)?;
                (ListenerInner::Unix(uds), endpoint.clone())
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "{endpoint} (unix sockets unsupported on this platform)"
                )))
            }
            Endpoint::Tcp { host, port } => {
                let listener = tcp::bind(host, *port, opts.backlog).await?;
                let port = listener.local_addr()?.port();
                (ListenerInner::Tcp(listener), Endpoint::tcp(host.clone(), port))
            }
            Endpoint::WebSocket { host, port, path } => {
                let listener = tcp::bind(host, *port, opts.backlog).await?;
                let port = listener.local_addr()?.port();
                (
                    ListenerInner::WebSocket {
                        listener,
                        path: path.clone(),
                    },
                    Endpoint::websocket(host.clone(), port, path.clone()),
                )
            }
        };

        Ok(Self {
            inner,
            endpoint: resolved,
            keepalive: opts.keepalive.clone(),
        })
    }

    /// The endpoint this listener is reachable at.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accept the next connection.
    ///
    /// Protocol handshakes are deferred to [`Incoming::establish`] so a slow
    /// peer cannot stall the accept loop.
    pub async fn accept(&self) -> Result<Incoming> {
        match &self.inner {
            #[cfg(unix)]
            ListenerInner::Unix(uds) => Ok(Incoming {
                kind: IncomingKind::Ready(uds.accept().await?),
            }),
            ListenerInner::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(TransportError::Accept)?;
                tcp::configure_stream(&stream, &self.keepalive);
                debug!(%addr, "accepted tcp connection");
                Ok(Incoming {
                    kind: IncomingKind::Ready(IpcStream::from_tcp(stream)),
                })
            }
            ListenerInner::WebSocket { listener, path } => {
                let (stream, addr) = listener.accept().await.map_err(TransportError::Accept)?;
                tcp::configure_stream(&stream, &self.keepalive);
                debug!(%addr, "accepted websocket candidate");
                Ok(Incoming {
                    kind: IncomingKind::WebSocket {
                        stream,
                        path: path.clone(),
                    },
                })
            }
        }
    }
}

enum IncomingKind {
    Ready(IpcStream),
    WebSocket { stream: TcpStream, path: String },
}

/// An accepted connection that may still need a protocol handshake.
pub struct Incoming {
    kind: IncomingKind,
}

impl Incoming {
    /// Peer address for logging.
    pub fn peer_addr(&self) -> String {
        match &self.kind {
            IncomingKind::Ready(stream) => stream.peer_addr().to_string(),
            IncomingKind::WebSocket { stream, .. } => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "websocket".to_string()),
        }
    }

    /// Finish any handshake and return the usable stream.
    pub async fn establish(self) -> Result<IpcStream> {
        match self.kind {
            IncomingKind::Ready(stream) => Ok(stream),
            IncomingKind::WebSocket { stream, path } => {
                let ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, WsStream::accept(stream, &path))
                    .await
                    .map_err(|_| {
                        TransportError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "websocket handshake timed out",
                        ))
                    })??;
                Ok(IpcStream::from_websocket(ws))
            }
        }
    }
}

/// Connect to any endpoint.
pub async fn connect(endpoint: &Endpoint, keepalive: &KeepaliveOptions) -> Result<IpcStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => UnixDomainSocket::connect(path).await,
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(TransportError::InvalidEndpoint(format!(
            "{endpoint} (unix sockets unsupported on this platform)"
        ))),
        Endpoint::Tcp { host, port } => {
            let stream = tcp::connect(host, *port, keepalive).await?;
            Ok(IpcStream::from_tcp(stream))
        }
        Endpoint::WebSocket { host, port, .. } => {
            let stream = tcp::connect(host, *port, keepalive).await?;
            let ws = WsStream::connect(stream, &endpoint.to_string()).await?;
            Ok(IpcStream::from_websocket(ws))
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn echo_once(listener: IpcListener) {
        let incoming = listener.accept().await.unwrap();
        let mut stream = incoming.establish().await.unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(&buf[..n]).await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn roundtrip(endpoint: Endpoint) {
        let listener = IpcListener::bind(&endpoint, &BindOptions::default())
            .await
            .unwrap();
        let target = listener.local_endpoint().clone();
        let server = tokio::spawn(echo_once(listener));

        let mut client = connect(&target, &KeepaliveOptions::default())
            .await
            .unwrap();
        client.write_all(b"ping over the wire").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = vec![0u8; 18];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping over the wire");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_roundtrip_resolves_ephemeral_port() {
        let listener = IpcListener::bind(&Endpoint::tcp("127.0.0.1", 0), &BindOptions::default())
            .await
            .unwrap();
        assert_ne!(listener.local_endpoint().port(), Some(0));
        drop(listener);

        roundtrip(Endpoint::tcp("127.0.0.1", 0)).await;
    }

    #[tokio::test]
    async fn websocket_roundtrip() {
        roundtrip(Endpoint::websocket("127.0.0.1", 0, "/ws")).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_roundtrip() {
        let dir = std::env::temp_dir().join(format!("fw-listener-{}", std::process::id()));
        roundtrip(Endpoint::unix(dir.join("echo.sock"))).await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn websocket_rejects_unknown_path() {
        let listener = IpcListener::bind(
            &Endpoint::websocket("127.0.0.1", 0, "/ws"),
            &BindOptions::default(),
        )
        .await
        .unwrap();
        let port = listener.local_endpoint().port().unwrap();
        let server = tokio::spawn(async move {
            let incoming = listener.accept().await.unwrap();
            incoming.establish().await
        });

        let wrong = Endpoint::websocket("127.0.0.1", port, "/elsewhere");
        let err = connect(&wrong, &KeepaliveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::WebSocket(_)));
        assert!(server.await.unwrap().is_err());
    }
}
