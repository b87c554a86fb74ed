//! Channel interfaces shared by every binding.
//!
//! Callers program against these traits; the transport selector decides
//! which implementation sits behind them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetwire_frame::Message;
use fleetwire_transport::Endpoint;
use tokio::runtime::Handle;

use crate::error::Result;
use crate::process::ProcessManager;

/// Invoked with every message a publish client receives in callback mode.
pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Invoked with `true` on (re)connect and `false` when the connection drops.
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// How a request server sends a handler's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Encrypt with the configured crypt, if any.
    Send,
    /// Always send in the clear.
    SendClear,
}

/// Client side of a request/reply channel.
#[async_trait]
pub trait RequestChannel: Send + Sync {
    /// Establish the connection eagerly. `None` retries until closed.
    async fn connect(&self, timeout: Option<Duration>) -> Result<()>;

    /// Send `load` and wait for the correlated reply, retrying timed-out
    /// attempts up to `tries` times with `timeout` per attempt.
    async fn send(&self, load: Message, tries: u32, timeout: Duration) -> Result<Message>;

    /// Release the connection and fail outstanding calls. Idempotent.
    async fn close(&self);

    fn endpoint(&self) -> &Endpoint;
}

/// Subscriber side of a publish channel.
#[async_trait]
pub trait PublishChannel: Send + Sync {
    async fn connect(
        &self,
        timeout: Option<Duration>,
        on_connection: Option<ConnectionCallback>,
    ) -> Result<()>;

    /// Poll for the next message; `Ok(None)` when the timeout elapses.
    async fn recv(&self, timeout: Option<Duration>) -> Result<Option<Message>>;

    /// Switch to callback delivery (`Some`) or back to polling (`None`).
    fn on_recv(&self, callback: Option<MessageCallback>);

    async fn close(&self);
}

/// Application logic behind a request server.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, payload: Message) -> Result<(Message, Dispatch)>;
}

/// Server side of a request/reply channel.
#[async_trait]
pub trait RequestService: Send + Sync {
    /// Bind the listening socket and register the front loop with `manager`.
    async fn pre_fork(&self, manager: &dyn ProcessManager) -> Result<()>;

    /// Install the handler and start pool workers on `runtime`.
    async fn post_fork(&self, handler: Arc<dyn RequestHandler>, runtime: &Handle) -> Result<()>;

    async fn close(&self);

    /// The bound front endpoint, once `pre_fork` has run.
    fn endpoint(&self) -> Option<Endpoint>;
}

/// Server side of a publish channel.
#[async_trait]
pub trait PublishService: Send + Sync {
    /// Register the publish daemon with `manager`.
    async fn pre_fork(&self, manager: &dyn ProcessManager) -> Result<()>;

    /// Broadcast `load`, optionally restricted to the subscribers in `topics`.
    async fn publish(&self, load: Message, topics: Option<Vec<String>>) -> Result<()>;

    /// Wait until the daemon is listening and return its endpoint.
    async fn wait_started(&self) -> Result<Endpoint>;

    async fn close(&self);
}

struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(Message, Dispatch)>> + Send + 'static,
{
    async fn handle(&self, payload: Message) -> Result<(Message, Dispatch)> {
        (self.0)(payload).await
    }
}

/// Build a [`RequestHandler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(Message, Dispatch)>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

#[async_trait]
impl<T: RequestChannel + ?Sized> RequestChannel for Box<T> {
    async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        (**self).connect(timeout).await
    }

    async fn send(&self, load: Message, tries: u32, timeout: Duration) -> Result<Message> {
        (**self).send(load, tries, timeout).await
    }

    async fn close(&self) {
        (**self).close().await
    }

    fn endpoint(&self) -> &Endpoint {
        (**self).endpoint()
    }
}

#[async_trait]
impl<T: PublishChannel + ?Sized> PublishChannel for Box<T> {
    async fn connect(
        &self,
        timeout: Option<Duration>,
        on_connection: Option<ConnectionCallback>,
    ) -> Result<()> {
        (**self).connect(timeout, on_connection).await
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        (**self).recv(timeout).await
    }

    fn on_recv(&self, callback: Option<MessageCallback>) {
        (**self).on_recv(callback)
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait]
impl<T: RequestService + ?Sized> RequestService for Box<T> {
    async fn pre_fork(&self, manager: &dyn ProcessManager) -> Result<()> {
        (**self).pre_fork(manager).await
    }

    async fn post_fork(&self, handler: Arc<dyn RequestHandler>, runtime: &Handle) -> Result<()> {
        (**self).post_fork(handler, runtime).await
    }

    async fn close(&self) {
        (**self).close().await
    }

    fn endpoint(&self) -> Option<Endpoint> {
        (**self).endpoint()
    }
}

#[async_trait]
impl<T: PublishService + ?Sized> PublishService for Box<T> {
    async fn pre_fork(&self, manager: &dyn ProcessManager) -> Result<()> {
        (**self).pre_fork(manager).await
    }

    async fn publish(&self, load: Message, topics: Option<Vec<String>>) -> Result<()> {
        (**self).publish(load, topics).await
    }

    async fn wait_started(&self) -> Result<Endpoint> {
        (**self).wait_started().await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
