use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleetwire_channel::{
    ConnectionCallback, MessageCallback, ProcessManager, PublishChannel, PublishService,
    RequestChannel, RequestHandler, RequestService, Result,
};
use fleetwire_frame::Message;
use fleetwire_transport::Endpoint;
use tokio::runtime::Handle;
use tracing::{debug, info_span, warn, Instrument};

/// Runs every call of the wrapped channel inside a `tracing` span and logs
/// its parameters and outcome.
pub struct Traced<C> {
    inner: C,
    label: &'static str,
}

impl<C> Traced<C> {
    pub fn new(inner: C) -> Self {
        Self::with_label(inner, "channel")
    }

    /// Name recorded on every span, to tell several wrapped channels apart.
    pub fn with_label(inner: C, label: &'static str) -> Self {
        Self { inner, label }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

fn outcome<T>(op: &str, started: Instant, result: &Result<T>) {
    match result {
        Ok(_) => debug!(op, elapsed = ?started.elapsed(), "ok"),
        Err(err) => warn!(op, elapsed = ?started.elapsed(), %err, "failed"),
    }
}

#[async_trait]
impl<C: RequestChannel> RequestChannel for Traced<C> {
    async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        let span = info_span!("request.connect", label = self.label, endpoint = %self.inner.endpoint(), ?timeout);
        async {
            let started = Instant::now();
            let result = self.inner.connect(timeout).await;
            outcome("connect", started, &result);
            result
        }
        .instrument(span)
        .await
    }

    async fn send(&self, load: Message, tries: u32, timeout: Duration) -> Result<Message> {
        let span = info_span!("request.send", label = self.label, endpoint = %self.inner.endpoint(), tries, ?timeout);
        async {
            debug!(%load, "sending");
            let started = Instant::now();
            let result = self.inner.send(load, tries, timeout).await;
            outcome("send", started, &result);
            result
        }
        .instrument(span)
        .await
    }

    async fn close(&self) {
        let span = info_span!("request.close", label = self.label, endpoint = %self.inner.endpoint());
        self.inner.close().instrument(span).await;
    }

    fn endpoint(&self) -> &Endpoint {
        self.inner.endpoint()
    }
}

#[async_trait]
impl<C: PublishChannel> PublishChannel for Traced<C> {
    async fn connect(
        &self,
        timeout: Option<Duration>,
        on_connection: Option<ConnectionCallback>,
    ) -> Result<()> {
        let span = info_span!("subscribe.connect", label = self.label, ?timeout);
        async {
            let started = Instant::now();
            let result = self.inner.connect(timeout, on_connection).await;
            outcome("connect", started, &result);
            result
        }
        .instrument(span)
        .await
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        let span = info_span!("subscribe.recv", label = self.label, ?timeout);
        async {
            let result = self.inner.recv(timeout).await;
            match &result {
                Ok(Some(message)) => debug!(%message, "received"),
                Ok(None) => debug!("nothing received before timeout"),
                Err(err) => warn!(%err, "recv failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    fn on_recv(&self, callback: Option<MessageCallback>) {
        debug!(label = self.label, callback = callback.is_some(), "switching receive mode");
        self.inner.on_recv(callback);
    }

    async fn close(&self) {
        let span = info_span!("subscribe.close", label = self.label);
        self.inner.close().instrument(span).await;
    }
}

#[async_trait]
impl<C: RequestService> RequestService for Traced<C> {
    async fn pre_fork(&self, manager: &dyn ProcessManager) -> Result<()> {
        let span = info_span!("serve.pre_fork", label = self.label);
        async {
            let started = Instant::now();
            let result = self.inner.pre_fork(manager).await;
            outcome("pre_fork", started, &result);
            result
        }
        .instrument(span)
        .await
    }

    async fn post_fork(&self, handler: Arc<dyn RequestHandler>, runtime: &Handle) -> Result<()> {
        let span = info_span!("serve.post_fork", label = self.label);
        async {
            let started = Instant::now();
            let result = self.inner.post_fork(handler, runtime).await;
            outcome("post_fork", started, &result);
            result
        }
        .instrument(span)
        .await
    }

    async fn close(&self) {
        let span = info_span!("serve.close", label = self.label);
        self.inner.close().instrument(span).await;
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint()
    }
}

#[async_trait]
impl<C: PublishService> PublishService for Traced<C> {
    async fn pre_fork(&self, manager: &dyn ProcessManager) -> Result<()> {
        let span = info_span!("publish.pre_fork", label = self.label);
        async {
            let started = Instant::now();
            let result = self.inner.pre_fork(manager).await;
            outcome("pre_fork", started, &result);
            result
        }
        .instrument(span)
        .await
    }

    async fn publish(&self, load: Message, topics: Option<Vec<String>>) -> Result<()> {
        let span = info_span!("publish.publish", label = self.label, ?topics);
        async {
            debug!(%load, "publishing");
            let started = Instant::now();
            let result = self.inner.publish(load, topics).await;
            outcome("publish", started, &result);
            result
        }
        .instrument(span)
        .await
    }

    async fn wait_started(&self) -> Result<Endpoint> {
        let span = info_span!("publish.wait_started", label = self.label);
        async {
            let result = self.inner.wait_started().await;
            if let Ok(endpoint) = &result {
                debug!(%endpoint, "publisher started");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn close(&self) {
        let span = info_span!("publish.close", label = self.label);
        self.inner.close().instrument(span).await;
    }
}

#[cfg(test)]
mod tests {
    use fleetwire_channel::{
        handler_fn, Binding, Dispatch, RequestClient, RequestServer, TaskManager, TransportConfig,
    };
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn traced_channels_forward_calls() {
        let config = TransportConfig {
            ret_port: 0,
            publish_port: 0,
            ..TransportConfig::default()
        };
        let server = Traced::with_label(
            RequestServer::new(&config, Binding::Tcp).expect("server should build"),
            "server",
        );
        let manager = TaskManager::new(Handle::current());
        RequestService::pre_fork(&server, &manager)
            .await
            .expect("pre_fork should succeed");
        server
            .post_fork(
                handler_fn(|load| async move { Ok((load, Dispatch::Send)) }),
                &Handle::current(),
            )
            .await
            .expect("post_fork should succeed");
        let endpoint = RequestService::endpoint(&server).expect("server should be bound");

        let client_config = TransportConfig {
            ret_port: endpoint.port().expect("tcp endpoint should have a port"),
            ..config
        };
        let client = Traced::new(
            RequestClient::new(&client_config, Binding::Tcp).expect("client should build"),
        );
        assert_eq!(RequestChannel::endpoint(&client), client.inner().endpoint());
        let reply = RequestChannel::send(&client, json!({"traced": true}), 1, Duration::from_secs(5))
            .await
            .expect("request should succeed");
        assert_eq!(reply, json!({"traced": true}));

        RequestChannel::close(&client).await;
        RequestService::close(&server).await;
        manager.shutdown().await;
    }
}
