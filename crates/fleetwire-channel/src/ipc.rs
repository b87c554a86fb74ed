//! Node-local message endpoints.
//!
//! An [`IpcServer`] accepts any number of connections on a [`LocalAddr`] and
//! hands every decoded frame to a [`PayloadHandler`] together with a
//! [`Replier`] for the connection it arrived on. An [`IpcClient`] is the
//! matching single-connection sender.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetwire_frame::{
    Frame, FrameConfig, FrameError, FrameReader, FrameWriter, Head, Message,
};
use fleetwire_transport::{
    BindOptions, Endpoint, Incoming, IpcListener, IpcStream, KeepaliveOptions, LocalAddr,
};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connect::connect_with_backoff;
use crate::error::{ChannelError, Result};
use crate::process::{ProcessFuture, ProcessManager};

/// Default delay between connect attempts of an [`IpcClient`].
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

type Writer = FrameWriter<WriteHalf<IpcStream>>;
type Reader = FrameReader<ReadHalf<IpcStream>>;

/// Receives the frames an [`IpcServer`] decodes.
///
/// Frames from one connection are delivered in order; the next frame is
/// read only after `handle` returns.
#[async_trait]
pub trait PayloadHandler: Send + Sync + 'static {
    async fn handle(&self, frame: Frame, replier: Replier);

    /// A complete frame arrived that could not be decoded.
    async fn handle_malformed(&self, error: FrameError, replier: Replier) {
        warn!(peer = %replier.peer(), %error, "dropping undecodable frame");
    }
}

/// Write handle back to the connection a frame arrived on.
#[derive(Clone)]
pub struct Replier {
    writer: Arc<tokio::sync::Mutex<Writer>>,
    peer: Arc<str>,
}

impl Replier {
    fn new(writer: Writer, peer: &str) -> Self {
        Self {
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            peer: Arc::from(peer),
        }
    }

    /// Encode and write one frame.
    pub async fn reply(&self, body: &Message, head: Option<&Head>) -> Result<()> {
        self.writer.lock().await.send(body, head).await?;
        Ok(())
    }

    /// Write bytes that already hold an encoded frame.
    pub async fn reply_encoded(&self, wire: &[u8]) -> Result<()> {
        self.writer.lock().await.write_encoded(wire).await?;
        Ok(())
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

struct ServerState {
    token: Option<CancellationToken>,
    stopped: Option<oneshot::Receiver<()>>,
    endpoint: Option<Endpoint>,
    closed: bool,
}

/// Accepts connections on a local address and dispatches decoded frames.
pub struct IpcServer {
    endpoint: Endpoint,
    handler: Arc<dyn PayloadHandler>,
    bind_options: BindOptions,
    frame_config: FrameConfig,
    state: Mutex<ServerState>,
}

impl IpcServer {
    /// Server on a socket path (string/path) or loopback port (integer).
    pub fn new(addr: impl Into<LocalAddr>, handler: Arc<dyn PayloadHandler>) -> Self {
        Self::with_endpoint(addr.into().endpoint(), handler)
    }

    /// Server on an arbitrary endpoint.
    pub fn with_endpoint(endpoint: Endpoint, handler: Arc<dyn PayloadHandler>) -> Self {
        Self {
            endpoint,
            handler,
            bind_options: BindOptions::default(),
            frame_config: FrameConfig::default(),
            state: Mutex::new(ServerState {
                token: None,
                stopped: None,
                endpoint: None,
                closed: false,
            }),
        }
    }

    pub fn with_bind_options(mut self, options: BindOptions) -> Self {
        self.bind_options = options;
        self
    }

    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    /// Bind and start accepting on the current runtime.
    ///
    /// Returns the bound endpoint (with any ephemeral port resolved).
    pub async fn start(&self) -> Result<Endpoint> {
        let (endpoint, serve) = self.prepare().await?;
        tokio::spawn(serve);
        Ok(endpoint)
    }

    /// Bind now and hand the accept loop to `manager` under `name`.
    pub async fn start_with(&self, manager: &dyn ProcessManager, name: &str) -> Result<Endpoint> {
        let (endpoint, serve) = self.prepare().await?;
        manager.add_process(name, serve);
        Ok(endpoint)
    }

    async fn prepare(&self) -> Result<(Endpoint, ProcessFuture)> {
        if self.lock_state().closed {
            return Err(ChannelError::Closed);
        }
        if let Some(endpoint) = self.local_endpoint() {
            return Err(ChannelError::Config(format!(
                "server already listening on {endpoint}"
            )));
        }

        let listener = IpcListener::bind(&self.endpoint, &self.bind_options).await?;
        let endpoint = listener.local_endpoint().clone();
        let token = CancellationToken::new();
        let (stopped_tx, stopped_rx) = oneshot::channel();

        {
            let mut state = self.lock_state();
            state.token = Some(token.clone());
            state.stopped = Some(stopped_rx);
            state.endpoint = Some(endpoint.clone());
        }
        info!(%endpoint, "ipc server listening");

        let serve = accept_loop(
            listener,
            self.handler.clone(),
            self.frame_config.clone(),
            token,
            stopped_tx,
        );
        Ok((endpoint, Box::pin(serve)))
    }

    /// The bound endpoint while the server is running.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.lock_state().endpoint.clone()
    }

    /// Stop accepting, release the listening socket and drop every accepted
    /// connection. Idempotent; safe if never started.
    pub async fn close(&self) {
        let (token, stopped) = {
            let mut state = self.lock_state();
            state.closed = true;
            state.endpoint = None;
            (state.token.take(), state.stopped.take())
        };
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(stopped) = stopped {
            let _ = stopped.await;
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        crate::lock(&self.state)
    }
}

async fn accept_loop(
    listener: IpcListener,
    handler: Arc<dyn PayloadHandler>,
    frame_config: FrameConfig,
    token: CancellationToken,
    _stopped: oneshot::Sender<()>,
) {
    let endpoint = listener.local_endpoint().clone();
    loop {
        let incoming = tokio::select! {
            _ = token.cancelled() => break,
            incoming = listener.accept() => incoming,
        };
        match incoming {
            Ok(incoming) => {
                tokio::spawn(serve_connection(
                    incoming,
                    handler.clone(),
                    frame_config.clone(),
                    token.child_token(),
                ));
            }
            Err(err) => {
                warn!(%endpoint, %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    debug!(%endpoint, "ipc server stopped accepting");
}

async fn serve_connection(
    incoming: Incoming,
    handler: Arc<dyn PayloadHandler>,
    frame_config: FrameConfig,
    token: CancellationToken,
) {
    let peer = incoming.peer_addr();
    let stream = tokio::select! {
        _ = token.cancelled() => return,
        stream = incoming.establish() => stream,
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(err) => {
            debug!(%peer, %err, "connection setup failed");
            return;
        }
    };

    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::with_config(read_half, frame_config.clone());
    let replier = Replier::new(FrameWriter::with_config(write_half, frame_config), &peer);
    debug!(%peer, "connection opened");

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = reader.read_frame() => next,
        };
        match next {
            Ok(Some(frame)) => handler.handle(frame, replier.clone()).await,
            Ok(None) => {
                debug!(%peer, "peer closed connection");
                break;
            }
            Err(err) if err.is_recoverable() => {
                handler.handle_malformed(err, replier.clone()).await
            }
            Err(FrameError::Io(err)) => {
                warn!(%peer, %err, "connection read failed");
                break;
            }
            Err(err) => {
                warn!(%peer, %err, "stream desynchronized; dropping connection");
                break;
            }
        }
    }
}

/// Single-connection client for an [`IpcServer`].
pub struct IpcClient {
    endpoint: Endpoint,
    backoff: Duration,
    keepalive: KeepaliveOptions,
    frame_config: FrameConfig,
    writer: tokio::sync::Mutex<Option<Writer>>,
    reader: tokio::sync::Mutex<Option<Reader>>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl IpcClient {
    pub fn new(addr: impl Into<LocalAddr>) -> Self {
        Self::with_endpoint(addr.into().endpoint())
    }

    pub fn with_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            backoff: DEFAULT_BACKOFF,
            keepalive: KeepaliveOptions::default(),
            frame_config: FrameConfig::default(),
            writer: tokio::sync::Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveOptions) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connect, retrying until `timeout` elapses (forever when `None`).
    /// Returns immediately if already connected.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        self.ensure_connected(&mut writer, timeout).await
    }

    async fn ensure_connected(
        &self,
        writer: &mut Option<Writer>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if writer.is_some() {
            return Ok(());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let stream = connect_with_backoff(
            &self.endpoint,
            &self.keepalive,
            self.backoff,
            deadline,
            &self.token,
        )
        .await?;
        let (read_half, write_half) = tokio::io::split(stream);
        *writer = Some(FrameWriter::with_config(write_half, self.frame_config.clone()));
        *self.reader.lock().await = Some(FrameReader::with_config(
            read_half,
            self.frame_config.clone(),
        ));
        Ok(())
    }

    /// Send a message, connecting first if needed.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.send_with_head(message, None).await
    }

    pub async fn send_with_head(&self, message: &Message, head: Option<&Head>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        self.ensure_connected(&mut writer, None).await?;
        let Some(active) = writer.as_mut() else {
            return Err(ChannelError::Closed);
        };
        if let Err(err) = active.send(message, head).await {
            debug!(endpoint = %self.endpoint, %err, "send failed; dropping connection");
            *writer = None;
            *self.reader.lock().await = None;
            return Err(err.into());
        }
        Ok(())
    }

    /// Read the next frame the server wrote back. `Ok(None)` on timeout.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Option<Frame>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Err(ChannelError::Disconnected("not connected".into()));
        };

        let next = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reader.read_frame()).await {
                Ok(next) => next,
                Err(_) => return Ok(None),
            },
            None => reader.read_frame().await,
        };
        match next {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                *guard = None;
                drop(guard);
                *self.writer.lock().await = None;
                Err(ChannelError::Disconnected("server closed connection".into()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Release the connection. Idempotent; safe if never connected.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
    }
}
