use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleetwire_frame::{Frame, FrameError, Head, Message};
use fleetwire_transport::Endpoint;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::client::{ClientOptions, MessageClient};
use super::router::Router;
use super::{error_kind, error_reply};
use crate::binding::{worker_addr, Binding};
use crate::config::{validate_pool_name, TransportConfig};
use crate::crypt::{CryptError, PayloadCrypt};
use crate::error::{ChannelError, Result};
use crate::ipc::{IpcServer, PayloadHandler, Replier};
use crate::lock;
use crate::process::ProcessManager;
use crate::traits::{Dispatch, RequestHandler, RequestService};

struct Job {
    payload: Message,
    head: Head,
    replier: Replier,
}

type JobQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

enum Route {
    ByCommand(Router),
    Fixed(usize),
}

/// Turns incoming frames into jobs on the worker pool queues.
struct Intake {
    route: Route,
    queues: Arc<[mpsc::Sender<Job>]>,
    crypt: Option<Arc<dyn PayloadCrypt>>,
}

#[async_trait]
impl PayloadHandler for Intake {
    async fn handle(&self, frame: Frame, replier: Replier) {
        let Frame { head, body } = frame;
        let payload = match &self.crypt {
            Some(crypt) => match crypt.decrypt(&body) {
                Ok(payload) => payload,
                Err(err) => {
                    let kind = match err {
                        CryptError::Auth(_) => error_kind::AUTH,
                        CryptError::Other(_) => error_kind::CRYPT,
                    };
                    warn!(peer = %replier.peer(), %err, "rejecting undecryptable request");
                    send_reply(&replier, &error_reply(kind, err.to_string()), &head).await;
                    return;
                }
            },
            None => body,
        };
        if !payload.is_object() {
            warn!(peer = %replier.peer(), "rejecting request that is not a mapping");
            let reply = error_reply(error_kind::DECODE, "bad load: expected a mapping");
            send_reply(&replier, &reply, &head).await;
            return;
        }

        let index = match &self.route {
            Route::ByCommand(router) => router.route(&payload),
            Route::Fixed(index) => *index,
        };
        let Some(queue) = self.queues.get(index) else {
            return;
        };
        let job = Job {
            payload,
            head,
            replier,
        };
        if queue.send(job).await.is_err() {
            debug!(pool = index, "worker queue closed; dropping request");
        }
    }

    async fn handle_malformed(&self, error: FrameError, replier: Replier) {
        warn!(peer = %replier.peer(), %error, "rejecting undecodable request");
        let reply = error_reply(error_kind::DECODE, error.to_string());
        send_reply(&replier, &reply, &Head::new()).await;
    }
}

async fn send_reply(replier: &Replier, reply: &Message, head: &Head) {
    if let Err(err) = replier.reply(reply, Some(head)).await {
        debug!(peer = %replier.peer(), %err, "reply not delivered");
    }
}

async fn worker_loop(
    pool: String,
    queue: JobQueue,
    handler: Arc<dyn RequestHandler>,
    crypt: Option<Arc<dyn PayloadCrypt>>,
) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        // Run the handler on its own task so a panic costs one reply, not the worker.
        let call = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle(job.payload).await })
        };
        let outcome = match call.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(%pool, %err, "request handler panicked");
                send_reply(
                    &job.replier,
                    &error_reply(error_kind::HANDLER, "request handler panicked"),
                    &job.head,
                )
                .await;
                continue;
            }
        };
        let reply = match outcome {
            Ok((reply, Dispatch::Send)) => match &crypt {
                Some(crypt) => crypt
                    .encrypt(&reply)
                    .unwrap_or_else(|err| error_reply(error_kind::CRYPT, err.to_string())),
                None => reply,
            },
            Ok((reply, Dispatch::SendClear)) => reply,
            Err(err) => {
                error!(%pool, %err, "request handler failed");
                error_reply(error_kind::HANDLER, err.to_string())
            }
        };
        send_reply(&job.replier, &reply, &job.head).await;
    }
    debug!(%pool, "worker stopped");
}

#[derive(Default)]
struct ServerState {
    front: Option<Arc<IpcServer>>,
    pool_servers: Vec<Arc<IpcServer>>,
    queues: Vec<JobQueue>,
    workers: Vec<JoinHandle<()>>,
    pool_endpoints: HashMap<String, Endpoint>,
    forwarders: HashMap<String, Arc<MessageClient>>,
    started: bool,
}

struct Inner {
    config: TransportConfig,
    binding: Binding,
    router: Router,
    crypt: Option<Arc<dyn PayloadCrypt>>,
    state: tokio::sync::Mutex<ServerState>,
    endpoint: Mutex<Option<Endpoint>>,
    closed: AtomicBool,
}

/// Request server: a front socket feeding per-pool job queues, drained by
/// worker tasks that run the installed [`RequestHandler`].
#[derive(Clone)]
pub struct RequestServer {
    inner: Arc<Inner>,
}

impl RequestServer {
    /// Validates `config` before anything touches the filesystem or network.
    pub fn new(config: &TransportConfig, binding: Binding) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                binding,
                router: Router::new(config.effective_pools()),
                crypt: None,
                state: tokio::sync::Mutex::new(ServerState::default()),
                endpoint: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Decrypt requests and encrypt `Dispatch::Send` replies through `crypt`.
    ///
    /// Must be called before the server is shared.
    pub fn with_crypt(mut self, crypt: Arc<dyn PayloadCrypt>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.crypt = Some(crypt),
            None => warn!("request server already shared; crypt not installed"),
        }
        self
    }

    pub fn binding(&self) -> Binding {
        self.inner.binding
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Bound endpoints of the exposed per-pool sockets.
    pub async fn pool_endpoints(&self) -> HashMap<String, Endpoint> {
        self.inner.state.lock().await.pool_endpoints.clone()
    }

    /// Send `payload` to a pool's local worker socket and wait for the reply.
    pub async fn forward_message(&self, pool: &str, payload: Message) -> Result<Message> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        validate_pool_name(pool)?;
        if !inner.config.expose_worker_sockets {
            return Err(ChannelError::Config(
                "worker sockets are not exposed; set expose_worker_sockets".into(),
            ));
        }
        if inner.router.position(pool).is_none() {
            return Err(ChannelError::Config(format!("unknown worker pool {pool:?}")));
        }

        let client = {
            let mut state = inner.state.lock().await;
            let endpoint = match state.pool_endpoints.get(pool) {
                Some(endpoint) => endpoint.clone(),
                None => worker_addr(&inner.config, pool)?.endpoint(),
            };
            state
                .forwarders
                .entry(pool.to_string())
                .or_insert_with(|| {
                    Arc::new(MessageClient::new(
                        endpoint,
                        ClientOptions::from_config(&inner.config),
                    ))
                })
                .clone()
        };
        let frame = client
            .request(&payload, None, inner.config.request_timeout())
            .await?;
        Ok(frame.into_body())
    }

    async fn bind_pool_sockets(
        &self,
        manager: &dyn ProcessManager,
        queues: &Arc<[mpsc::Sender<Job>]>,
        state: &mut ServerState,
    ) -> Result<()> {
        let config = &self.inner.config;
        for (index, pool) in self.inner.router.pools().iter().enumerate() {
            let intake = Intake {
                route: Route::Fixed(index),
                queues: queues.clone(),
                crypt: None,
            };
            let server = Arc::new(
                IpcServer::new(worker_addr(config, &pool.name)?, Arc::new(intake))
                    .with_bind_options(config.bind_options())
                    .with_frame_config(config.frame_config()),
            );
            let process = format!("request-pool-{}", pool.name);
            let endpoint = server.start_with(manager, &process).await?;
            debug!(pool = %pool.name, %endpoint, "worker pool socket bound");
            state.pool_endpoints.insert(pool.name.clone(), endpoint);
            state.pool_servers.push(server);
        }
        Ok(())
    }
}

#[async_trait]
impl RequestService for RequestServer {
    async fn pre_fork(&self, manager: &dyn ProcessManager) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let mut guard = inner.state.lock().await;
        let state = &mut *guard;
        if state.front.is_some() {
            return Err(ChannelError::Config("request server already bound".into()));
        }

        let config = &inner.config;
        let (senders, receivers): (Vec<_>, Vec<_>) = inner
            .router
            .pools()
            .iter()
            .map(|_| mpsc::channel(config.worker_queue_depth))
            .unzip();
        let queues: Arc<[mpsc::Sender<Job>]> = senders.into();

        let intake = Intake {
            route: Route::ByCommand(inner.router.clone()),
            queues: queues.clone(),
            crypt: inner.crypt.clone(),
        };
        let front = Arc::new(
            IpcServer::with_endpoint(inner.binding.request_bind(config), Arc::new(intake))
                .with_bind_options(config.bind_options())
                .with_frame_config(config.frame_config()),
        );
        let endpoint = front.start_with(manager, "request-front").await?;
        state.front = Some(front);

        if config.expose_worker_sockets {
            if let Err(err) = self.bind_pool_sockets(manager, &queues, state).await {
                for server in state.pool_servers.drain(..).chain(state.front.take()) {
                    server.close().await;
                }
                state.pool_endpoints.clear();
                return Err(err);
            }
        }

        state.queues = receivers
            .into_iter()
            .map(|rx| Arc::new(tokio::sync::Mutex::new(rx)))
            .collect();
        info!(
            %endpoint,
            binding = %inner.binding,
            pools = inner.router.pools().len(),
            "request server bound"
        );
        *lock(&inner.endpoint) = Some(endpoint);
        Ok(())
    }

    async fn post_fork(&self, handler: Arc<dyn RequestHandler>, runtime: &Handle) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let mut state = inner.state.lock().await;
        if state.front.is_none() {
            return Err(ChannelError::Config(
                "request server must be bound (pre_fork) before workers start".into(),
            ));
        }
        if state.started {
            return Err(ChannelError::Config("request workers already started".into()));
        }

        let mut workers = Vec::new();
        for (pool, queue) in inner.router.pools().iter().zip(&state.queues) {
            for _ in 0..pool.worker_count {
                workers.push(runtime.spawn(worker_loop(
                    pool.name.clone(),
                    queue.clone(),
                    handler.clone(),
                    inner.crypt.clone(),
                )));
            }
            debug!(pool = %pool.name, workers = pool.worker_count, "worker pool started");
        }
        state.workers = workers;
        state.started = true;
        Ok(())
    }

    async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut guard = inner.state.lock().await;
        let state = &mut *guard;
        for server in state.front.take().into_iter().chain(state.pool_servers.drain(..)) {
            server.close().await;
        }
        for worker in state.workers.drain(..) {
            worker.abort();
        }
        for (_, client) in state.forwarders.drain() {
            client.close().await;
        }
        state.queues.clear();
        state.pool_endpoints.clear();
        *lock(&inner.endpoint) = None;
        debug!(binding = %inner.binding, "request server closed");
    }

    fn endpoint(&self) -> Option<Endpoint> {
        lock(&self.inner.endpoint).clone()
    }
}
