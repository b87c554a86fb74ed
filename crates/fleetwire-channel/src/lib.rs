//! Request/reply and publish/subscribe channels for fleet messaging.
//!
//! Both channel kinds run over any [`Binding`] (TCP, Unix domain sockets
//! or WebSocket) and exchange `fleetwire-frame` frames. Callers program
//! against the traits in [`traits`]; the concrete types here implement them.

pub mod binding;
pub mod config;
mod connect;
pub mod crypt;
pub mod error;
pub mod ipc;
pub mod process;
pub mod publish;
pub mod request;
pub mod traits;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use binding::{publish_pull_addr, worker_addr, Binding};
pub use config::{IpcMode, TransportConfig, WorkerPool, ANY_COMMAND};
pub use crypt::{ClearText, CryptError, PayloadCrypt};
pub use error::{ChannelError, Result};
pub use ipc::{IpcClient, IpcServer, PayloadHandler, Replier, DEFAULT_BACKOFF};
pub use process::{ProcessFuture, ProcessManager, TaskManager};
pub use publish::{
    IdentityFilter, PresenceHook, PublishClient, PublishReport, PublishServer, SubscriberFilter,
    SubscriberInfo,
};
pub use request::{
    error_reply, ConnectionPool, MessageClient, PooledClient, RequestClient, RequestServer,
    Router,
};
pub use traits::{
    handler_fn, ConnectionCallback, Dispatch, MessageCallback, PublishChannel, PublishService,
    RequestChannel, RequestHandler, RequestService,
};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
