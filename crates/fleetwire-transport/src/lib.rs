//! Stream transports for fleetwire channels.
//!
//! Provides one connected-stream type over every supported binding:
//! - Unix domain sockets (filesystem paths)
//! - TCP, with keepalive tuning and explicit listen backlogs
//! - WebSocket, carrying the byte stream as binary messages
//!
//! This is the lowest layer of fleetwire. Everything else builds on top of
//! the [`IpcStream`] and [`IpcListener`] types provided here.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stream;
pub mod tcp;
#[cfg(unix)]
pub mod uds;
pub mod ws;

pub use endpoint::{Endpoint, LocalAddr, LOOPBACK};
pub use error::{Result, TransportError};
pub use listener::{connect, BindOptions, Incoming, IpcListener};
pub use stream::IpcStream;
pub use tcp::KeepaliveOptions;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
