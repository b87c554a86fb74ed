//! Blocking facades for callers without an async runtime.
//!
//! Each facade owns a private Tokio runtime. Calling them from inside
//! another runtime panics, as with any `block_on`.

use std::time::Duration;

use fleetwire_channel::{
    ChannelError, ConnectionCallback, MessageCallback, PublishChannel, PublishService,
    RequestChannel, Result, TaskManager,
};
use fleetwire_frame::Message;
use fleetwire_transport::{Endpoint, TransportError};
use tokio::runtime::{Builder, Runtime};

fn runtime_error(err: std::io::Error) -> ChannelError {
    ChannelError::Transport(TransportError::Io(err))
}

/// Runs only inside `block_on`; replies arriving between calls wait in the
/// socket buffer.
fn current_thread() -> Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(runtime_error)
}

/// Keeps reconnect loops, the publish daemon and receive callbacks running
/// between calls.
fn background() -> Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("fleetwire-sync")
        .enable_all()
        .build()
        .map_err(runtime_error)
}

/// Blocking request client.
pub struct SyncRequestChannel<C> {
    inner: C,
    runtime: Runtime,
}

impl<C: RequestChannel> SyncRequestChannel<C> {
    pub fn new(inner: C) -> Result<Self> {
        Ok(Self {
            inner,
            runtime: current_thread()?,
        })
    }

    pub fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        self.runtime.block_on(self.inner.connect(timeout))
    }

    pub fn send(&self, load: Message, tries: u32, timeout: Duration) -> Result<Message> {
        self.runtime.block_on(self.inner.send(load, tries, timeout))
    }

    pub fn close(&self) {
        self.runtime.block_on(self.inner.close());
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.inner.endpoint()
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

/// Blocking subscriber. Callbacks registered with [`on_recv`](Self::on_recv)
/// fire on the facade's worker thread.
pub struct SyncPublishChannel<C> {
    inner: C,
    runtime: Runtime,
}

impl<C: PublishChannel> SyncPublishChannel<C> {
    pub fn new(inner: C) -> Result<Self> {
        Ok(Self {
            inner,
            runtime: background()?,
        })
    }

    pub fn connect(
        &self,
        timeout: Option<Duration>,
        on_connection: Option<ConnectionCallback>,
    ) -> Result<()> {
        self.runtime
            .block_on(self.inner.connect(timeout, on_connection))
    }

    pub fn recv(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.runtime.block_on(self.inner.recv(timeout))
    }

    pub fn on_recv(&self, callback: Option<MessageCallback>) {
        self.inner.on_recv(callback);
    }

    pub fn close(&self) {
        self.runtime.block_on(self.inner.close());
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

/// Blocking publisher that hosts its own daemon.
pub struct SyncPublishService<C> {
    inner: C,
    runtime: Runtime,
    manager: TaskManager,
}

impl<C: PublishService> SyncPublishService<C> {
    pub fn new(inner: C) -> Result<Self> {
        let runtime = background()?;
        let manager = TaskManager::new(runtime.handle().clone());
        Ok(Self {
            inner,
            runtime,
            manager,
        })
    }

    /// Start the daemon on the facade's runtime.
    pub fn pre_fork(&self) -> Result<()> {
        self.runtime.block_on(self.inner.pre_fork(&self.manager))
    }

    pub fn publish(&self, load: Message, topics: Option<Vec<String>>) -> Result<()> {
        self.runtime.block_on(self.inner.publish(load, topics))
    }

    pub fn wait_started(&self) -> Result<Endpoint> {
        self.runtime.block_on(self.inner.wait_started())
    }

    pub fn close(&self) {
        self.runtime.block_on(async {
            self.inner.close().await;
            self.manager.shutdown().await;
        });
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use fleetwire_channel::{
        handler_fn, Binding, Dispatch, PublishClient, PublishServer, RequestClient,
        RequestServer, RequestService, TransportConfig,
    };
    use serde_json::json;

    use super::*;
    use crate::wrap::Traced;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("fw-{tag}-{}-{nanos}", std::process::id()))
    }

    #[test]
    fn blocking_request_roundtrip() {
        let host = background().expect("host runtime should build");
        let config = TransportConfig {
            ret_port: 0,
            publish_port: 0,
            ..TransportConfig::default()
        };
        let server = RequestServer::new(&config, Binding::Tcp).expect("server should build");
        let manager = TaskManager::new(host.handle().clone());
        host.block_on(async {
            server.pre_fork(&manager).await.expect("pre_fork should succeed");
            server
                .post_fork(
                    handler_fn(|load| async move { Ok((load, Dispatch::Send)) }),
                    host.handle(),
                )
                .await
                .expect("post_fork should succeed");
        });
        let endpoint = server.endpoint().expect("server should be bound");

        let client_config = TransportConfig {
            ret_port: endpoint.port().expect("tcp endpoint should have a port"),
            ..config
        };
        let client = SyncRequestChannel::new(Traced::new(
            RequestClient::new(&client_config, Binding::Tcp).expect("client should build"),
        ))
        .expect("facade should build");

        client
            .connect(Some(Duration::from_secs(5)))
            .expect("connect should succeed");
        for n in 0..5 {
            let reply = client
                .send(json!({"n": n}), 1, Duration::from_secs(5))
                .expect("request should succeed");
            assert_eq!(reply, json!({"n": n}));
        }
        client.close();
        assert!(matches!(
            client.send(json!({}), 1, Duration::from_secs(1)),
            Err(ChannelError::Closed)
        ));

        host.block_on(async {
            server.close().await;
            manager.shutdown().await;
        });
    }

    #[test]
    fn blocking_publish_delivers_to_callback() {
        let sock_dir = temp_dir("sync-pub");
        let config = TransportConfig {
            transport: "ipc".into(),
            sock_dir: sock_dir.clone(),
            reconnect_backoff_secs: 0.02,
            ..TransportConfig::default()
        };
        let publisher = SyncPublishService::new(
            PublishServer::new(&config, Binding::Ipc).expect("publisher should build"),
        )
        .expect("facade should build");
        publisher.pre_fork().expect("pre_fork should succeed");
        publisher.wait_started().expect("daemon should start");

        let subscriber = SyncPublishChannel::new(
            PublishClient::new(&config, Binding::Ipc).expect("subscriber should build"),
        )
        .expect("facade should build");
        subscriber
            .connect(Some(Duration::from_secs(5)), None)
            .expect("connect should succeed");

        let (tx, rx) = mpsc::channel();
        subscriber.on_recv(Some(std::sync::Arc::new(move |message| {
            let _ = tx.send(message);
        })));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let received = loop {
            publisher
                .publish(json!({"beat": 1}), None)
                .expect("publish should succeed");
            if let Ok(message) = rx.recv_timeout(Duration::from_millis(50)) {
                break message;
            }
            assert!(std::time::Instant::now() < deadline, "no message delivered");
        };
        assert_eq!(received, json!({"beat": 1}));

        subscriber.close();
        publisher.close();
        let _ = std::fs::remove_dir_all(sock_dir);
    }
}
