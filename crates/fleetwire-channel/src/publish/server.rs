use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleetwire_frame::{Frame, FrameConfig, FrameReader, FrameWriter, Message};
use fleetwire_transport::{Endpoint, Incoming, IpcListener};
use serde_json::json;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fanout::{Fanout, PresenceHook, PublishReport, SubscriberFilter, SubscriberInfo};
use crate::binding::{publish_pull_addr, Binding};
use crate::config::TransportConfig;
use crate::error::{ChannelError, Result};
use crate::ipc::{IpcClient, IpcServer, PayloadHandler, Replier};
use crate::lock;
use crate::process::ProcessManager;
use crate::traits::PublishService;

/// Payload key of a pushed message.
pub const PAYLOAD_KEY: &str = "payload";
/// Topic list key of a pushed message; `null` broadcasts.
pub const TOPICS_KEY: &str = "topic_lst";
/// Key a subscriber announces its identity under.
pub const IDENTITY_KEY: &str = "id";

#[derive(Debug, Clone)]
enum DaemonStatus {
    Pending,
    Listening(Endpoint),
    Closed,
}

/// Feeds messages pushed to the pull endpoint into the fan-out.
struct PullHandler {
    fanout: Arc<Fanout>,
}

#[async_trait]
impl PayloadHandler for PullHandler {
    async fn handle(&self, frame: Frame, replier: Replier) {
        let (payload, topics) = match parse_push(frame.into_body()) {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(peer = %replier.peer(), %reason, "dropping malformed publish request");
                return;
            }
        };
        match self.fanout.publish(&payload, topics.as_deref()) {
            Ok(report) => debug!(?report, "published"),
            Err(err) => warn!(%err, "publish failed"),
        }
    }
}

fn parse_push(body: Message) -> std::result::Result<(Message, Option<Vec<String>>), String> {
    let Message::Object(mut map) = body else {
        return Err("expected a mapping".into());
    };
    let payload = map
        .remove(PAYLOAD_KEY)
        .ok_or_else(|| format!("missing {PAYLOAD_KEY:?}"))?;
    let topics = match map.remove(TOPICS_KEY) {
        None | Some(Message::Null) => None,
        Some(Message::Array(items)) => Some(
            items
                .into_iter()
                .map(|item| match item {
                    Message::String(topic) => Ok(topic),
                    other => Err(format!("topic {other} is not a string")),
                })
                .collect::<std::result::Result<Vec<_>, _>>()?,
        ),
        Some(other) => return Err(format!("{TOPICS_KEY:?} must be a list, got {other}")),
    };
    Ok((payload, topics))
}

/// A bound publish daemon, ready to run its accept loop.
struct Daemon {
    listener: IpcListener,
    pull: IpcServer,
    fanout: Arc<Fanout>,
    frame_config: FrameConfig,
    token: CancellationToken,
    _stopped: oneshot::Sender<()>,
}

impl Daemon {
    async fn run(self) {
        let endpoint = self.listener.local_endpoint().clone();
        loop {
            let incoming = tokio::select! {
                _ = self.token.cancelled() => break,
                incoming = self.listener.accept() => incoming,
            };
            match incoming {
                Ok(incoming) => {
                    tokio::spawn(serve_subscriber(
                        incoming,
                        self.fanout.clone(),
                        self.frame_config.clone(),
                        self.token.child_token(),
                    ));
                }
                Err(err) => {
                    warn!(%endpoint, %err, "subscriber accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
        self.pull.close().await;
        info!(%endpoint, "publish daemon stopped");
    }
}

async fn serve_subscriber(
    incoming: Incoming,
    fanout: Arc<Fanout>,
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
            debug!(%peer, %err, "subscriber setup failed");
            return;
        }
    };

    let (id, mut queue) = fanout.register(&peer);
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::with_config(read_half, frame_config.clone());
    let mut writer = FrameWriter::with_config(write_half, frame_config);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            wire = queue.recv() => {
                let Some(wire) = wire else { break };
                if let Err(err) = writer.write_encoded(&wire).await {
                    debug!(subscriber = id, %peer, %err, "subscriber write failed");
                    break;
                }
            }
            next = reader.read_frame() => match next {
                Ok(Some(frame)) => {
                    if let Some(identity) = frame.body.get(IDENTITY_KEY).and_then(Message::as_str) {
                        fanout.announce(id, identity);
                    }
                }
                Ok(None) => break,
                Err(err) if err.is_recoverable() => {
                    warn!(subscriber = id, %peer, %err, "dropping undecodable subscriber frame");
                }
                Err(err) => {
                    debug!(subscriber = id, %peer, %err, "subscriber read failed");
                    break;
                }
            },
        }
    }
    fanout.remove(id);
}

struct Inner {
    config: TransportConfig,
    binding: Binding,
    fanout: Arc<Fanout>,
    status: watch::Sender<DaemonStatus>,
    token: CancellationToken,
    stopped: Mutex<Option<oneshot::Receiver<()>>>,
    pull_endpoint: Mutex<Option<Endpoint>>,
    pusher: tokio::sync::Mutex<Option<IpcClient>>,
    bound: AtomicBool,
    closed: AtomicBool,
}

/// Publish side of the pub/sub channel.
///
/// The daemon owns the subscriber set. Any task, or another process on the
/// same node, hands it messages through the local pull endpoint.
#[derive(Clone)]
pub struct PublishServer {
    inner: Arc<Inner>,
}

impl PublishServer {
    pub fn new(config: &TransportConfig, binding: Binding) -> Result<Self> {
        config.validate()?;
        let (status, _) = watch::channel(DaemonStatus::Pending);
        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                binding,
                fanout: Arc::new(Fanout::new(
                    config.pub_hwm,
                    config.filtering,
                    &config.frame_config(),
                )),
                status,
                token: CancellationToken::new(),
                stopped: Mutex::new(None),
                pull_endpoint: Mutex::new(None),
                pusher: tokio::sync::Mutex::new(None),
                bound: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn binding(&self) -> Binding {
        self.inner.binding
    }

    /// Replace the default [`IdentityFilter`](super::IdentityFilter).
    pub fn set_filter(&self, filter: Arc<dyn SubscriberFilter>) {
        self.inner.fanout.set_filter(filter);
    }

    pub fn set_presence(&self, hook: Option<Arc<dyn PresenceHook>>) {
        self.inner.fanout.set_presence(hook);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.fanout.len()
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        self.inner.fanout.subscribers()
    }

    /// The bound pull endpoint while the daemon runs.
    pub fn pull_endpoint(&self) -> Option<Endpoint> {
        lock(&self.inner.pull_endpoint).clone()
    }

    async fn bind(&self) -> Result<Daemon> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if inner.bound.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::Config("publish daemon already running".into()));
        }

        let config = &inner.config;
        let bound = async {
            let listener =
                IpcListener::bind(&inner.binding.publish_bind(config), &config.bind_options())
                    .await?;
            let pull = IpcServer::new(
                publish_pull_addr(config),
                Arc::new(PullHandler {
                    fanout: inner.fanout.clone(),
                }),
            )
            .with_bind_options(config.bind_options())
            .with_frame_config(config.frame_config());
            let pull_endpoint = pull.start().await?;
            Ok::<_, ChannelError>((listener, pull, pull_endpoint))
        }
        .await;
        let (listener, pull, pull_endpoint) = match bound {
            Ok(bound) => bound,
            Err(err) => {
                inner.bound.store(false, Ordering::Release);
                return Err(err);
            }
        };

        let endpoint = listener.local_endpoint().clone();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        *lock(&inner.stopped) = Some(stopped_rx);
        *lock(&inner.pull_endpoint) = Some(pull_endpoint.clone());
        inner.status.send_replace(DaemonStatus::Listening(endpoint.clone()));
        info!(%endpoint, pull = %pull_endpoint, binding = %inner.binding, "publish daemon listening");

        Ok(Daemon {
            listener,
            pull,
            fanout: inner.fanout.clone(),
            frame_config: config.frame_config(),
            token: inner.token.clone(),
            _stopped: stopped_tx,
        })
    }

    /// Bind the publish and pull endpoints and serve subscribers until closed.
    pub async fn publish_daemon(&self, presence: Option<Arc<dyn PresenceHook>>) -> Result<()> {
        if presence.is_some() {
            self.set_presence(presence);
        }
        self.bind().await?.run().await;
        Ok(())
    }

    /// Fan `load` out from this process, bypassing the pull endpoint.
    pub fn publish_local(&self, load: &Message, topics: Option<&[String]>) -> Result<PublishReport> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.inner.fanout.publish(load, topics)
    }

    async fn push(&self, load: Message, topics: Option<Vec<String>>) -> Result<()> {
        let inner = &self.inner;
        let mut pusher = inner.pusher.lock().await;
        if pusher.is_none() {
            let endpoint = lock(&inner.pull_endpoint)
                .clone()
                .unwrap_or_else(|| publish_pull_addr(&inner.config).endpoint());
            *pusher = Some(
                IpcClient::with_endpoint(endpoint)
                    .with_backoff(inner.config.reconnect_backoff())
                    .with_keepalive(inner.config.keepalive.clone())
                    .with_frame_config(inner.config.frame_config()),
            );
        }
        let Some(client) = pusher.as_ref() else {
            return Err(ChannelError::Closed);
        };
        client.connect(Some(inner.config.request_timeout())).await?;
        client
            .send(&json!({PAYLOAD_KEY: load, TOPICS_KEY: topics}))
            .await
    }
}

#[async_trait]
impl PublishService for PublishServer {
    async fn pre_fork(&self, manager: &dyn ProcessManager) -> Result<()> {
        let daemon = self.bind().await?;
        manager.add_process("publish-daemon", Box::pin(daemon.run()));
        Ok(())
    }

    async fn publish(&self, load: Message, topics: Option<Vec<String>>) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.push(load, topics).await
    }

    async fn wait_started(&self) -> Result<Endpoint> {
        let mut status = self.inner.status.subscribe();
        let status = status
            .wait_for(|status| !matches!(status, DaemonStatus::Pending))
            .await
            .map_err(|_| ChannelError::Closed)?;
        match &*status {
            DaemonStatus::Listening(endpoint) => Ok(endpoint.clone()),
            _ => Err(ChannelError::Closed),
        }
    }

    async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.token.cancel();
        inner.status.send_replace(DaemonStatus::Closed);
        if let Some(pusher) = inner.pusher.lock().await.take() {
            pusher.close().await;
        }
        let stopped = lock(&inner.stopped).take();
        if let Some(stopped) = stopped {
            let _ = stopped.await;
        }
        lock(&inner.pull_endpoint).take();
        debug!(binding = %inner.binding, "publish server closed");
    }
}
