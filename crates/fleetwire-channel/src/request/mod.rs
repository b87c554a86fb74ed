//! Request/reply channel.
//!
//! Clients stamp every request with a correlation token in `head.mid` and
//! match replies by it, so many requests can share one connection. Servers
//! route requests to worker pools and write each reply back with the
//! request's head.

mod client;
mod pool;
mod router;
mod server;

use fleetwire_frame::Message;
use serde_json::json;

pub use client::{ClientOptions, MessageClient, RequestClient, MAX_MESSAGE_ID};
pub use pool::{ConnectionPool, PooledClient};
pub use router::{Router, COMMAND_KEY};
pub use server::RequestServer;

/// Error kinds carried in `{"error": {"kind": ...}}` replies.
pub mod error_kind {
    pub const AUTH: &str = "auth";
    pub const DECODE: &str = "decode";
    pub const HANDLER: &str = "handler";
    pub const CRYPT: &str = "crypt";
}

/// Build the reply sent in place of a result when a request cannot be served.
pub fn error_reply(kind: &str, message: impl Into<String>) -> Message {
    json!({"error": {"kind": kind, "message": message.into()}})
}

/// The error kind of an error reply, if `reply` is one.
pub fn error_reply_kind(reply: &Message) -> Option<&str> {
    reply.get("error")?.get("kind")?.as_str()
}
