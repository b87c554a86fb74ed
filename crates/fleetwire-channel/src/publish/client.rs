use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetwire_frame::{FrameConfig, FrameReader, FrameWriter, Message};
use fleetwire_transport::{Endpoint, IpcStream, KeepaliveOptions};
use serde_json::json;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::server::IDENTITY_KEY;
use crate::binding::Binding;
use crate::config::TransportConfig;
use crate::connect::connect_with_backoff;
use crate::error::{ChannelError, Result};
use crate::lock;
use crate::traits::{ConnectionCallback, MessageCallback, PublishChannel};

enum Delivery {
    Poll,
    Callback(MessageCallback),
}

struct Shared {
    delivery: Mutex<Delivery>,
    inbox: mpsc::Sender<Message>,
}

impl Shared {
    /// Queueing happens under the delivery lock so `on_recv` never misses a
    /// message that is about to land in the inbox.
    fn deliver(&self, message: Message) {
        let callback = {
            let delivery = lock(&self.delivery);
            match &*delivery {
                Delivery::Callback(callback) => callback.clone(),
                Delivery::Poll => {
                    match self.inbox.try_send(message) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("publish inbox full; dropping message");
                        }
                        Err(TrySendError::Closed(_)) => {}
                    }
                    return;
                }
            }
        };
        callback(message);
    }
}

/// A live subscription. The write half is kept so the connection stays
/// fully open while frames are read.
struct Link {
    reader: FrameReader<ReadHalf<IpcStream>>,
    _writer: FrameWriter<WriteHalf<IpcStream>>,
}

#[derive(Clone)]
struct Session {
    endpoint: Endpoint,
    keepalive: KeepaliveOptions,
    backoff: Duration,
    frame_config: FrameConfig,
    identity: Option<String>,
}

impl Session {
    /// Connect and announce the configured identity.
    async fn open(
        &self,
        deadline: Option<Instant>,
        token: &CancellationToken,
    ) -> Result<Link> {
        let stream =
            connect_with_backoff(&self.endpoint, &self.keepalive, self.backoff, deadline, token)
                .await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer = FrameWriter::with_config(write_half, self.frame_config.clone());
        if let Some(identity) = &self.identity {
            writer.send(&json!({IDENTITY_KEY: identity}), None).await?;
        }
        Ok(Link {
            reader: FrameReader::with_config(read_half, self.frame_config.clone()),
            _writer: writer,
        })
    }
}

/// Subscriber side of the pub/sub channel.
///
/// Messages are delivered to a registered callback, or queued (up to
/// `pub_hwm`) for [`PublishClient::recv`] when none is registered.
pub struct PublishClient {
    session: Session,
    binding: Binding,
    shared: Arc<Shared>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    task: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl PublishClient {
    pub fn new(config: &TransportConfig, binding: Binding) -> Result<Self> {
        config.validate()?;
        let (inbox_tx, inbox_rx) = mpsc::channel(config.pub_hwm);
        Ok(Self {
            session: Session {
                endpoint: binding.publish_connect(config),
                keepalive: config.keepalive.clone(),
                backoff: config.reconnect_backoff(),
                frame_config: config.frame_config(),
                identity: config.id.clone(),
            },
            binding,
            shared: Arc::new(Shared {
                delivery: Mutex::new(Delivery::Poll),
                inbox: inbox_tx,
            }),
            inbox: tokio::sync::Mutex::new(inbox_rx),
            task: Mutex::new(None),
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.session.endpoint
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    /// Whether the background receive task is running.
    pub fn is_connected(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|task| !task.is_finished())
    }
}

async fn receive_loop(
    session: Session,
    mut link: Link,
    shared: Arc<Shared>,
    on_connection: Option<ConnectionCallback>,
    token: CancellationToken,
) {
    let notify = |up: bool| {
        if let Some(callback) = &on_connection {
            callback(up);
        }
    };
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return,
            next = link.reader.read_frame() => next,
        };
        let reason = match next {
            Ok(Some(frame)) => {
                shared.deliver(frame.into_body());
                continue;
            }
            Err(err) if err.is_recoverable() => {
                warn!(endpoint = %session.endpoint, %err, "dropping undecodable message");
                continue;
            }
            Ok(None) => "publisher closed the connection".to_string(),
            Err(err) => err.to_string(),
        };

        warn!(endpoint = %session.endpoint, %reason, "publish connection lost; reconnecting");
        notify(false);
        link = match session.open(None, &token).await {
            Ok(link) => link,
            Err(err) => {
                debug!(endpoint = %session.endpoint, %err, "publish client stopped reconnecting");
                return;
            }
        };
        info!(endpoint = %session.endpoint, "publish connection restored");
        notify(true);
    }
}

#[async_trait]
impl PublishChannel for PublishClient {
    async fn connect(
        &self,
        timeout: Option<Duration>,
        on_connection: Option<ConnectionCallback>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if self.is_connected() {
            return Ok(());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let link = self.session.open(deadline, &self.token).await?;
        if let Some(callback) = &on_connection {
            callback(true);
        }
        debug!(endpoint = %self.session.endpoint, "publish client connected");

        let task = tokio::spawn(receive_loop(
            self.session.clone(),
            link,
            self.shared.clone(),
            on_connection,
            self.token.clone(),
        ));
        if let Some(previous) = lock(&self.task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if matches!(*lock(&self.shared.delivery), Delivery::Callback(_)) {
            return Err(ChannelError::ReceiveMode(
                "a message callback is registered; recv is unavailable",
            ));
        }

        let mut inbox = self.inbox.lock().await;
        let next = async {
            tokio::select! {
                _ = self.token.cancelled() => Err(ChannelError::Closed),
                message = inbox.recv() => message.map(Some).ok_or(ChannelError::Closed),
            }
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, next)
                .await
                .unwrap_or(Ok(None)),
            None => next.await,
        }
    }

    fn on_recv(&self, callback: Option<MessageCallback>) {
        let Some(callback) = callback else {
            *lock(&self.shared.delivery) = Delivery::Poll;
            return;
        };
        // Hand over anything queued while polling before newer messages can
        // reach the callback. The callback must not call `on_recv` here.
        let mut delivery = lock(&self.shared.delivery);
        if let Ok(mut inbox) = self.inbox.try_lock() {
            while let Ok(message) = inbox.try_recv() {
                callback(message);
            }
        }
        *delivery = Delivery::Callback(callback);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!(endpoint = %self.session.endpoint, "publish client closed");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::runtime::Handle;

    use super::*;
    use crate::config::IpcMode;
    use crate::process::TaskManager;
    use crate::publish::PublishServer;
    use crate::traits::PublishService;

    fn make_sock_dir(tag: &str) -> PathBuf {
        PathBuf::from(format!(
            "/tmp/fw-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ))
    }

    fn ipc_config(sock_dir: PathBuf) -> TransportConfig {
        TransportConfig {
            sock_dir,
            ipc_mode: IpcMode::Ipc,
            reconnect_backoff_secs: 0.02,
            ..TransportConfig::default()
        }
    }

    async fn start(config: &TransportConfig) -> (PublishServer, TaskManager) {
        let server = PublishServer::new(config, Binding::Ipc).expect("server should build");
        let manager = TaskManager::new(Handle::current());
        server.pre_fork(&manager).await.expect("daemon should bind");
        server.wait_started().await.expect("daemon should be listening");
        (server, manager)
    }

    async fn wait_subscribers(server: &PublishServer, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.subscriber_count() != count {
            assert!(Instant::now() < deadline, "subscriber count never reached {count}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn poll_receive_over_unix_socket() {
        let sock_dir = make_sock_dir("pub-poll");
        let config = ipc_config(sock_dir.clone());
        let (server, manager) = start(&config).await;

        let client = PublishClient::new(&config, Binding::Ipc).expect("client should build");
        client
            .connect(Some(Duration::from_secs(5)), None)
            .await
            .expect("client should connect");
        wait_subscribers(&server, 1).await;

        assert_eq!(
            client
                .recv(Some(Duration::from_millis(50)))
                .await
                .expect("recv should succeed"),
            None
        );
        server
            .publish_local(&json!({"foo": "bar"}), None)
            .expect("publish should succeed");
        let message = client
            .recv(Some(Duration::from_secs(5)))
            .await
            .expect("recv should succeed");
        assert_eq!(message, Some(json!({"foo": "bar"})));

        client.close().await;
        client.close().await;
        assert!(matches!(client.recv(None).await, Err(ChannelError::Closed)));
        server.close().await;
        manager.shutdown().await;
        let _ = std::fs::remove_dir_all(&sock_dir);
    }

    #[tokio::test]
    async fn callback_mode_excludes_polling() {
        let sock_dir = make_sock_dir("pub-cb");
        let config = TransportConfig {
            id: Some("minion-7".into()),
            ..ipc_config(sock_dir.clone())
        };
        let (server, manager) = start(&config).await;

        let client = PublishClient::new(&config, Binding::Ipc).expect("client should build");
        client
            .connect(Some(Duration::from_secs(5)), None)
            .await
            .expect("client should connect");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !server
            .subscribers()
            .iter()
            .any(|s| s.identity.as_deref() == Some("minion-7"))
        {
            assert!(Instant::now() < deadline, "identity never announced");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on_recv(Some(Arc::new(move |message| {
            let _ = tx.send(message);
        })));
        assert!(matches!(
            client.recv(Some(Duration::from_millis(10))).await,
            Err(ChannelError::ReceiveMode(_))
        ));

        let topics = vec!["minion-7".to_string()];
        server
            .publish_local(&json!("targeted"), Some(&topics))
            .expect("publish should succeed");
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("callback should fire in time");
        assert_eq!(received, Some(json!("targeted")));

        client.on_recv(None);
        server
            .publish_local(&json!("polled"), None)
            .expect("publish should succeed");
        assert_eq!(
            client
                .recv(Some(Duration::from_secs(5)))
                .await
                .expect("recv should succeed"),
            Some(json!("polled"))
        );

        client.close().await;
        server.close().await;
        manager.shutdown().await;
        let _ = std::fs::remove_dir_all(&sock_dir);
    }

    #[tokio::test]
    async fn switching_to_callback_keeps_order() {
        let sock_dir = make_sock_dir("pub-order");
        let config = ipc_config(sock_dir.clone());
        let (server, manager) = start(&config).await;

        let client = PublishClient::new(&config, Binding::Ipc).expect("client should build");
        client
            .connect(Some(Duration::from_secs(5)), None)
            .await
            .expect("client should connect");
        wait_subscribers(&server, 1).await;

        for n in 0..5 {
            server
                .publish_local(&json!({"n": n}), None)
                .expect("publish should succeed");
        }
        let inbox = &client.shared.inbox;
        let deadline = Instant::now() + Duration::from_secs(5);
        while inbox.max_capacity() - inbox.capacity() < 5 {
            assert!(Instant::now() < deadline, "messages never queued");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // These race the switch below: some queue, some reach the callback.
        for n in 5..10 {
            server
                .publish_local(&json!({"n": n}), None)
                .expect("publish should succeed");
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on_recv(Some(Arc::new(move |message| {
            let _ = tx.send(message);
        })));
        for n in 10..15 {
            server
                .publish_local(&json!({"n": n}), None)
                .expect("publish should succeed");
        }

        for n in 0..15 {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("callback should fire in time");
            assert_eq!(message, Some(json!({"n": n})));
        }

        client.close().await;
        server.close().await;
        manager.shutdown().await;
        let _ = std::fs::remove_dir_all(&sock_dir);
    }

    #[tokio::test]
    async fn reconnects_after_publisher_restart() {
        let sock_dir = make_sock_dir("pub-restart");
        let config = ipc_config(sock_dir.clone());
        let (server, manager) = start(&config).await;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let client = PublishClient::new(&config, Binding::Ipc).expect("client should build");
        client
            .connect(
                Some(Duration::from_secs(5)),
                Some(Arc::new(move |up| {
                    let _ = events_tx.send(up);
                })),
            )
            .await
            .expect("client should connect");
        assert_eq!(events.recv().await, Some(true));

        server.close().await;
        manager.shutdown().await;
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("loss should be reported"),
            Some(false)
        );

        let (server, manager) = start(&config).await;
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("reconnect should be reported"),
            Some(true)
        );
        wait_subscribers(&server, 1).await;
        server
            .publish_local(&json!("after restart"), None)
            .expect("publish should succeed");
        assert_eq!(
            client
                .recv(Some(Duration::from_secs(5)))
                .await
                .expect("recv should succeed"),
            Some(json!("after restart"))
        );

        client.close().await;
        server.close().await;
        manager.shutdown().await;
        let _ = std::fs::remove_dir_all(&sock_dir);
    }

    #[tokio::test]
    async fn connect_times_out_without_publisher() {
        let sock_dir = make_sock_dir("pub-none");
        let client = PublishClient::new(&ipc_config(sock_dir), Binding::Ipc)
            .expect("client should build");
        let err = client
            .connect(Some(Duration::from_millis(100)), None)
            .await
            .expect_err("nobody is publishing");
        assert!(matches!(err, ChannelError::Connect { .. }));
        client.close().await;
    }
}
