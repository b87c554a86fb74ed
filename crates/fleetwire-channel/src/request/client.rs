use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetwire_frame::{
    Frame, FrameCodec, FrameConfig, FrameWriter, Head, Message, MESSAGE_ID_KEY,
};
use fleetwire_transport::{Endpoint, IpcStream, KeepaliveOptions};
use futures_util::StreamExt;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pool::ConnectionPool;
use super::{error_kind, error_reply_kind};
use crate::binding::Binding;
use crate::config::TransportConfig;
use crate::connect::connect_with_backoff;
use crate::crypt::{CryptError, PayloadCrypt};
use crate::error::{ChannelError, Result};
use crate::ipc::DEFAULT_BACKOFF;
use crate::lock;
use crate::traits::RequestChannel;

/// Largest correlation token; minting wraps back to 1 after it.
pub const MAX_MESSAGE_ID: u64 = (1 << 31) - 2;

/// Connection settings shared by every client in a pool.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub keepalive: KeepaliveOptions,
    pub backoff: Duration,
    pub frame_config: FrameConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            keepalive: KeepaliveOptions::default(),
            backoff: DEFAULT_BACKOFF,
            frame_config: FrameConfig::default(),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            keepalive: config.keepalive.clone(),
            backoff: config.reconnect_backoff(),
            frame_config: config.frame_config(),
        }
    }
}

struct Pending {
    /// Connection the request was written on; 0 until written.
    generation: u64,
    reply: oneshot::Sender<Result<Frame>>,
}

struct Correlation {
    next_id: u64,
    pending: HashMap<u64, Pending>,
}

impl Correlation {
    fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Next free token in `1..=MAX_MESSAGE_ID`, skipping tokens in flight.
    fn mint(&mut self) -> u64 {
        loop {
            let id = self.next_id;
            self.next_id = if id >= MAX_MESSAGE_ID { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn fail_where(&mut self, keep: impl Fn(&Pending) -> bool, err: impl Fn() -> ChannelError) {
        let failed: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pending)| !keep(pending))
            .map(|(mid, _)| *mid)
            .collect();
        for mid in failed {
            if let Some(pending) = self.pending.remove(&mid) {
                let _ = pending.reply.send(Err(err()));
            }
        }
    }
}

struct Connection {
    writer: FrameWriter<WriteHalf<IpcStream>>,
    reader: JoinHandle<()>,
    generation: u64,
}

/// One multiplexed request connection.
///
/// Connects lazily, correlates replies by `head.mid`, and fails every
/// outstanding call when the connection drops or the client is closed.
pub struct MessageClient {
    endpoint: Endpoint,
    options: ClientOptions,
    conn: tokio::sync::Mutex<Option<Connection>>,
    correlation: Arc<Mutex<Correlation>>,
    generation: AtomicU64,
    load: AtomicUsize,
    token: CancellationToken,
    closed: AtomicBool,
}

impl MessageClient {
    pub fn new(endpoint: Endpoint, options: ClientOptions) -> Self {
        Self {
            endpoint,
            options,
            conn: tokio::sync::Mutex::new(None),
            correlation: Arc::new(Mutex::new(Correlation::new())),
            generation: AtomicU64::new(0),
            load: AtomicUsize::new(0),
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Requests in flight plus outstanding pool leases.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    pub(crate) fn lease(&self) {
        self.load.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unlease(&self) {
        self.load.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of requests awaiting a reply.
    pub fn pending(&self) -> usize {
        lock(&self.correlation).pending.len()
    }

    /// Connect eagerly. `None` retries until closed.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut conn = self.conn.lock().await;
        self.ensure_open(&mut conn, deadline).await
    }

    async fn ensure_open(&self, conn: &mut Option<Connection>, deadline: Option<Instant>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if conn.as_ref().is_some_and(|c| !c.reader.is_finished()) {
            return Ok(());
        }

        let stream = connect_with_backoff(
            &self.endpoint,
            &self.options.keepalive,
            self.options.backoff,
            deadline,
            &self.token,
        )
        .await?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (read_half, write_half) = tokio::io::split(stream);
        let frames = FramedRead::new(
            read_half,
            FrameCodec::with_config(self.options.frame_config.clone()),
        );
        let reader = tokio::spawn(read_replies(
            frames,
            self.correlation.clone(),
            generation,
            self.endpoint.clone(),
            self.token.clone(),
        ));
        *conn = Some(Connection {
            writer: FrameWriter::with_config(write_half, self.options.frame_config.clone()),
            reader,
            generation,
        });
        Ok(())
    }

    /// Send one request and wait for its correlated reply.
    ///
    /// Connecting, writing and waiting all share the `timeout` budget. An
    /// unreachable peer is reported as [`ChannelError::Connect`], a silent
    /// one as [`ChannelError::Timeout`].
    pub async fn request(&self, body: &Message, head: Option<Head>, timeout: Duration) -> Result<Frame> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        let mid = {
            let mut correlation = lock(&self.correlation);
            let mid = correlation.mint();
            correlation.pending.insert(
                mid,
                Pending {
                    generation: 0,
                    reply: tx,
                },
            );
            mid
        };
        let _in_flight = InFlight::new(self, mid);

        let mut head = head.unwrap_or_default();
        head.insert(MESSAGE_ID_KEY.to_string(), mid.into());
        self.write(mid, body, &head, deadline, timeout).await?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ChannelError::Disconnected("reply slot dropped".into())),
            Err(_) => {
                debug!(endpoint = %self.endpoint, mid, "request timed out");
                Err(ChannelError::Timeout { tries: 1, timeout })
            }
        }
    }

    async fn write(
        &self,
        mid: u64,
        body: &Message,
        head: &Head,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        self.ensure_open(&mut conn, Some(deadline)).await?;
        let Some(active) = conn.as_mut() else {
            return Err(ChannelError::Closed);
        };
        if let Some(pending) = lock(&self.correlation).pending.get_mut(&mid) {
            pending.generation = active.generation;
        }

        let outcome = tokio::time::timeout_at(deadline, active.writer.send(body, Some(head))).await;
        let err = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => ChannelError::from(err),
            Err(_) => ChannelError::Timeout { tries: 1, timeout },
        };
        // A partial write leaves the stream misaligned; start over next time.
        warn!(endpoint = %self.endpoint, mid, %err, "request write failed; dropping connection");
        if let Some(dead) = conn.take() {
            dead.reader.abort();
            // The aborted reader cannot fail its own calls any more.
            lock(&self.correlation).fail_where(
                |pending| pending.generation != dead.generation,
                || ChannelError::Disconnected("connection dropped after a failed write".into()),
            );
        }
        Err(err)
    }

    /// Close the connection and fail outstanding calls with
    /// [`ChannelError::Closed`]. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        if let Some(mut conn) = self.conn.lock().await.take() {
            conn.reader.abort();
            let _ = conn.writer.shutdown().await;
        }
        lock(&self.correlation).fail_where(|_| false, || ChannelError::Closed);
    }
}

/// Removes the pending entry and releases load when a request ends for any
/// reason, including cancellation of the calling future.
struct InFlight<'a> {
    client: &'a MessageClient,
    mid: u64,
}

impl<'a> InFlight<'a> {
    fn new(client: &'a MessageClient, mid: u64) -> Self {
        client.load.fetch_add(1, Ordering::AcqRel);
        Self { client, mid }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(&self.client.correlation).pending.remove(&self.mid);
        self.client.load.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn read_replies(
    mut frames: FramedRead<ReadHalf<IpcStream>, FrameCodec>,
    correlation: Arc<Mutex<Correlation>>,
    generation: u64,
    endpoint: Endpoint,
    token: CancellationToken,
) {
    let reason = loop {
        let next = tokio::select! {
            _ = token.cancelled() => return,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                let Some(mid) = frame.message_id() else {
                    debug!(%endpoint, "reply without message id; ignoring");
                    continue;
                };
                let pending = lock(&correlation).pending.remove(&mid);
                match pending {
                    Some(pending) => {
                        let _ = pending.reply.send(Ok(frame));
                    }
                    None => debug!(%endpoint, mid, "reply for unknown or expired request"),
                }
            }
            Some(Err(err)) if err.is_recoverable() => {
                warn!(%endpoint, %err, "dropping undecodable reply");
            }
            Some(Err(err)) => break err.to_string(),
            None => break "connection closed by peer".to_string(),
        }
    };

    debug!(%endpoint, generation, %reason, "reply stream ended");
    lock(&correlation).fail_where(
        |pending| pending.generation != generation,
        || ChannelError::Disconnected(reason.clone()),
    );
}

/// Request channel over a pool of [`MessageClient`] connections.
pub struct RequestClient {
    endpoint: Endpoint,
    binding: Binding,
    pool: ConnectionPool,
    crypt: Option<Arc<dyn PayloadCrypt>>,
    reauth: tokio::sync::Mutex<()>,
}

impl RequestClient {
    pub fn new(config: &TransportConfig, binding: Binding) -> Result<Self> {
        config.validate()?;
        let endpoint = binding.request_connect(config);
        let pool = ConnectionPool::open(
            endpoint.clone(),
            ClientOptions::from_config(config),
            config.request_pool_size,
        );
        Ok(Self {
            endpoint,
            binding,
            pool,
            crypt: None,
            reauth: tokio::sync::Mutex::new(()),
        })
    }

    /// Encrypt requests and decrypt replies through `crypt`.
    pub fn with_crypt(mut self, crypt: Arc<dyn PayloadCrypt>) -> Self {
        self.crypt = Some(crypt);
        self
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn attempt(&self, load: &Message, timeout: Duration) -> Result<Message> {
        let client = self.pool.acquire()?;
        let frame = client.request(load, None, timeout).await?;
        Ok(frame.into_body())
    }

    async fn send_with_retries(&self, load: &Message, tries: u32, timeout: Duration) -> Result<Message> {
        let tries = tries.max(1);
        let mut last = None;
        for attempt in 1..=tries {
            match self.attempt(load, timeout).await {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_retryable() => {
                    if attempt < tries {
                        warn!(endpoint = %self.endpoint, attempt, tries, %err, "request attempt failed; retrying");
                    }
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(match last {
            Some(ChannelError::Timeout { .. }) | None => ChannelError::Timeout { tries, timeout },
            Some(err) => err,
        })
    }

    async fn send_encrypted(
        &self,
        crypt: &dyn PayloadCrypt,
        load: &Message,
        tries: u32,
        timeout: Duration,
    ) -> Result<Message> {
        let mut reauthed = false;
        loop {
            let wire = crypt.encrypt(load)?;
            let reply = self.send_with_retries(&wire, tries, timeout).await?;
            let failure = if error_reply_kind(&reply) == Some(error_kind::AUTH) {
                reply["error"]["message"]
                    .as_str()
                    .unwrap_or("rejected by peer")
                    .to_string()
            } else {
                match crypt.decrypt(&reply) {
                    Ok(message) => return Ok(message),
                    Err(CryptError::Auth(msg)) => msg,
                    Err(err) => return Err(err.into()),
                }
            };

            if reauthed {
                return Err(ChannelError::Auth(failure));
            }
            warn!(endpoint = %self.endpoint, %failure, "authentication failed; re-authenticating");
            {
                let _serialized = self.reauth.lock().await;
                crypt.reauth().await?;
            }
            reauthed = true;
        }
    }
}

#[async_trait]
impl RequestChannel for RequestClient {
    async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        for client in self.pool.clients() {
            client.connect(timeout).await?;
        }
        Ok(())
    }

    async fn send(&self, load: Message, tries: u32, timeout: Duration) -> Result<Message> {
        match &self.crypt {
            Some(crypt) => self.send_encrypted(crypt.as_ref(), &load, tries, timeout).await,
            None => self.send_with_retries(&load, tries, timeout).await,
        }
    }

    async fn close(&self) {
        self.pool.shutdown().await;
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;

    use fleetwire_frame::FrameReader;
    use fleetwire_transport::{BindOptions, IpcListener};
    use futures_util::future::join_all;
    use serde_json::json;

    use super::*;
    use crate::ipc::{IpcServer, PayloadHandler, Replier};
    use crate::request::error_reply;

    /// Replies with the request body after a delay taken from `body["delay_ms"]`.
    struct DelayedEcho;

    #[async_trait]
    impl PayloadHandler for DelayedEcho {
        async fn handle(&self, frame: Frame, replier: Replier) {
            let delay = frame.body["delay_ms"].as_u64().unwrap_or(0);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let _ = replier.reply(&frame.body, Some(&frame.head)).await;
            });
        }
    }

    struct Silent;

    #[async_trait]
    impl PayloadHandler for Silent {
        async fn handle(&self, _frame: Frame, _replier: Replier) {}
    }

    async fn start(handler: Arc<dyn PayloadHandler>) -> (IpcServer, TransportConfig) {
        let server = IpcServer::new(0u16, handler);
        let endpoint = server.start().await.expect("server should start");
        let config = TransportConfig {
            ret_port: endpoint.port().expect("tcp endpoint should have a port"),
            publish_port: 0,
            reconnect_backoff_secs: 0.02,
            ..TransportConfig::default()
        };
        (server, config)
    }

    #[test]
    fn mint_wraps_and_skips_in_flight_ids() {
        let mut correlation = Correlation::new();
        correlation.next_id = MAX_MESSAGE_ID - 1;
        for id in [1, 2] {
            let (tx, _rx) = oneshot::channel();
            correlation.pending.insert(id, Pending { generation: 1, reply: tx });
        }

        assert_eq!(correlation.mint(), MAX_MESSAGE_ID - 1);
        assert_eq!(correlation.mint(), MAX_MESSAGE_ID);
        assert_eq!(correlation.mint(), 3);
    }

    #[tokio::test]
    async fn basic_request_roundtrip() {
        let (server, config) = start(Arc::new(DelayedEcho)).await;
        let client = RequestClient::new(&config, Binding::Tcp).expect("client should build");

        let reply = client
            .send(json!({"foo": "bar"}), 1, Duration::from_secs(5))
            .await
            .expect("request should succeed");
        assert_eq!(reply, json!({"foo": "bar"}));

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_by_correlation() {
        let (server, config) = start(Arc::new(DelayedEcho)).await;
        let client = RequestClient::new(&config, Binding::Tcp).expect("client should build");

        // Later requests finish first, so replies arrive out of order.
        let calls = (0..40u64).map(|i| {
            let value = (i * 7919) % 1009;
            let client = &client;
            async move {
                let load = json!({"value": value, "delay_ms": (40 - i) * 3});
                let reply = client
                    .send(load.clone(), 1, Duration::from_secs(10))
                    .await
                    .expect("request should succeed");
                assert_eq!(reply, load);
            }
        });
        join_all(calls).await;
        assert_eq!(client.pool().clients()[0].pending(), 0);

        client.close().await;
        server.close().await;
    }

    /// Echoes after `delay_ms` and records which connection each request used.
    struct PeerEcho {
        peers: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl PayloadHandler for PeerEcho {
        async fn handle(&self, frame: Frame, replier: Replier) {
            lock(&self.peers).insert(replier.peer().to_string());
            DelayedEcho.handle(frame, replier).await;
        }
    }

    #[tokio::test]
    async fn pooled_requests_spread_and_resolve_by_correlation() {
        let handler = Arc::new(PeerEcho {
            peers: Mutex::new(HashSet::new()),
        });
        let (server, config) = start(handler.clone()).await;
        let config = TransportConfig {
            request_pool_size: 4,
            ..config
        };
        let client = RequestClient::new(&config, Binding::Tcp).expect("client should build");
        assert_eq!(client.pool().size(), 4);

        let calls = (0..40u64).map(|i| {
            let client = &client;
            async move {
                let load = json!({"caller": i, "delay_ms": (40 - i) * 2});
                let reply = client
                    .send(load.clone(), 1, Duration::from_secs(10))
                    .await
                    .expect("request should succeed");
                assert_eq!(reply, load);
            }
        });
        join_all(calls).await;

        let connected = {
            let mut connected = 0;
            for pooled in client.pool().clients() {
                assert_eq!(pooled.pending(), 0);
                if pooled.conn.lock().await.is_some() {
                    connected += 1;
                }
            }
            connected
        };
        assert!(connected > 1, "only {connected} pooled connection carried traffic");
        assert!(lock(&handler.peers).len() > 1);

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn failed_write_fails_other_calls_on_the_connection() {
        let listener = IpcListener::bind(&Endpoint::tcp("127.0.0.1", 0), &BindOptions::default())
            .await
            .expect("listener should bind");
        let endpoint = listener.local_endpoint().clone();
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        // Accepts one connection and never reads from it.
        let server = tokio::spawn(async move {
            let stream = listener
                .accept()
                .await
                .expect("accept should succeed")
                .establish()
                .await
                .expect("stream should be ready");
            let _ = hold_rx.await;
            drop(stream);
        });

        let options = ClientOptions {
            frame_config: FrameConfig {
                max_payload_size: 64 * 1024 * 1024,
            },
            ..ClientOptions::default()
        };
        let client = Arc::new(MessageClient::new(endpoint, options));
        let first = {
            let client = client.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let result = client
                    .request(&json!({"cmd": "first"}), None, Duration::from_secs(4))
                    .await;
                (result, started.elapsed())
            })
        };
        while client.pending() == 0 || client.conn.lock().await.is_none() {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Far larger than the socket buffers, so the write stalls.
        let blob = "x".repeat(32 * 1024 * 1024);
        let err = client
            .request(&json!({"blob": blob}), None, Duration::from_millis(300))
            .await
            .expect_err("stalled write should fail");
        assert!(matches!(err, ChannelError::Timeout { .. }), "got {err:?}");

        let (result, elapsed) = first.await.expect("first request task should finish");
        assert!(matches!(result, Err(ChannelError::Disconnected(_))), "got {result:?}");
        assert!(elapsed < Duration::from_secs(2), "first request took {elapsed:?}");
        assert_eq!(client.pending(), 0);

        let _ = hold_tx.send(());
        server.await.expect("server task should finish");
    }

    #[tokio::test]
    async fn silent_server_times_out_after_single_try() {
        let (server, config) = start(Arc::new(Silent)).await;
        let client = RequestClient::new(&config, Binding::Tcp).expect("client should build");

        let started = Instant::now();
        let err = client
            .send(json!({"cmd": "ping"}), 1, Duration::from_millis(100))
            .await
            .expect_err("silent server should time out");
        let elapsed = started.elapsed();

        assert!(matches!(err, ChannelError::Timeout { tries: 1, .. }), "got {err:?}");
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(client.pool().clients()[0].pending(), 0);

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_connect_error() {
        let listener = IpcListener::bind(&Endpoint::tcp("127.0.0.1", 0), &BindOptions::default())
            .await
            .expect("listener should bind");
        let port = listener.local_endpoint().port().expect("port should be set");
        drop(listener);

        let config = TransportConfig {
            ret_port: port,
            publish_port: 0,
            reconnect_backoff_secs: 0.02,
            ..TransportConfig::default()
        };
        let client = RequestClient::new(&config, Binding::Tcp).expect("client should build");
        let err = client
            .send(json!({}), 2, Duration::from_millis(100))
            .await
            .expect_err("nobody is listening");
        assert!(matches!(err, ChannelError::Connect { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn dropped_connection_fails_pending_request() {
        let listener = IpcListener::bind(&Endpoint::tcp("127.0.0.1", 0), &BindOptions::default())
            .await
            .expect("listener should bind");
        let endpoint = listener.local_endpoint().clone();
        let server = tokio::spawn(async move {
            let stream = listener
                .accept()
                .await
                .expect("accept should succeed")
                .establish()
                .await
                .expect("stream should be ready");
            let mut reader = FrameReader::new(stream);
            let _ = reader.read_frame().await;
        });

        let client = MessageClient::new(endpoint, ClientOptions::default());
        let err = client
            .request(&json!({"cmd": "hang"}), None, Duration::from_secs(5))
            .await
            .expect_err("server hangs up without replying");
        assert!(matches!(err, ChannelError::Disconnected(_)), "got {err:?}");
        assert_eq!(client.pending(), 0);
        server.await.expect("server task should finish");
    }

    #[tokio::test]
    async fn close_fails_in_flight_requests() {
        let (server, config) = start(Arc::new(Silent)).await;
        let client = Arc::new(MessageClient::new(
            Binding::Tcp.request_connect(&config),
            ClientOptions::default(),
        ));

        let waiting = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request(&json!({"cmd": "wait"}), None, Duration::from_secs(30))
                    .await
            })
        };
        while client.pending() == 0 || client.conn.lock().await.is_none() {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        client.close().await;
        client.close().await;
        let result = waiting.await.expect("request task should finish");
        assert!(matches!(result, Err(ChannelError::Closed)), "got {result:?}");
        assert!(matches!(
            client.request(&json!({}), None, Duration::from_secs(1)).await,
            Err(ChannelError::Closed)
        ));

        server.close().await;
    }

    #[tokio::test]
    async fn thousand_sequential_requests() {
        let (server, config) = start(Arc::new(DelayedEcho)).await;
        let client = RequestClient::new(&config, Binding::Tcp).expect("client should build");

        for i in 0..1000u32 {
            let reply = client
                .send(json!({"seq": i}), 1, Duration::from_secs(5))
                .await
                .expect("request should succeed");
            assert_eq!(reply["seq"], i);
        }

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn large_payload_roundtrip() {
        let (server, config) = start(Arc::new(DelayedEcho)).await;
        let client = RequestClient::new(&config, Binding::Tcp).expect("client should build");

        let blob: String = (0..100 * 1024).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let reply = client
            .send(json!({"blob": blob}), 1, Duration::from_secs(10))
            .await
            .expect("request should succeed");
        assert_eq!(reply["blob"], json!(blob));

        client.close().await;
        server.close().await;
    }

    /// Wraps loads as `{"enc": load}`; counts re-auths.
    struct WrapCrypt {
        reauths: AtomicU32,
    }

    #[async_trait]
    impl PayloadCrypt for WrapCrypt {
        fn encrypt(&self, load: &Message) -> std::result::Result<Message, CryptError> {
            Ok(json!({"enc": load}))
        }

        fn decrypt(&self, wire: &Message) -> std::result::Result<Message, CryptError> {
            wire.get("enc")
                .cloned()
                .ok_or_else(|| CryptError::Other("not encrypted".into()))
        }

        async fn reauth(&self) -> std::result::Result<(), CryptError> {
            self.reauths.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Rejects the first `reject` requests as unauthenticated, then echoes.
    struct AuthGate {
        reject: u32,
        seen: AtomicU32,
    }

    #[async_trait]
    impl PayloadHandler for AuthGate {
        async fn handle(&self, frame: Frame, replier: Replier) {
            let reply = if self.seen.fetch_add(1, Ordering::SeqCst) < self.reject {
                error_reply(error_kind::AUTH, "token expired")
            } else {
                frame.body.clone()
            };
            let _ = replier.reply(&reply, Some(&frame.head)).await;
        }
    }

    #[tokio::test]
    async fn auth_failure_triggers_one_reauth_then_succeeds() {
        let gate = Arc::new(AuthGate {
            reject: 1,
            seen: AtomicU32::new(0),
        });
        let (server, config) = start(gate.clone()).await;
        let crypt = Arc::new(WrapCrypt {
            reauths: AtomicU32::new(0),
        });
        let client = RequestClient::new(&config, Binding::Tcp)
            .expect("client should build")
            .with_crypt(crypt.clone());

        let reply = client
            .send(json!({"fun": "test.ping"}), 1, Duration::from_secs(5))
            .await
            .expect("request should succeed after reauth");
        assert_eq!(reply, json!({"fun": "test.ping"}));
        assert_eq!(crypt.reauths.load(Ordering::SeqCst), 1);
        assert_eq!(gate.seen.load(Ordering::SeqCst), 2);

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn repeated_auth_failure_surfaces_auth_error() {
        let gate = Arc::new(AuthGate {
            reject: u32::MAX,
            seen: AtomicU32::new(0),
        });
        let (server, config) = start(gate.clone()).await;
        let crypt = Arc::new(WrapCrypt {
            reauths: AtomicU32::new(0),
        });
        let client = RequestClient::new(&config, Binding::Tcp)
            .expect("client should build")
            .with_crypt(crypt.clone());

        let err = client
            .send(json!({"fun": "test.ping"}), 1, Duration::from_secs(5))
            .await
            .expect_err("auth should keep failing");
        assert!(matches!(err, ChannelError::Auth(_)), "got {err:?}");
        assert_eq!(crypt.reauths.load(Ordering::SeqCst), 1);
        assert_eq!(gate.seen.load(Ordering::SeqCst), 2);

        client.close().await;
        server.close().await;
    }
}
