//! Transport-agnostic messaging channels for fleet control planes.
//!
//! fleetwire moves JSON-shaped messages between a coordinating server and
//! many agents, over TCP, Unix domain sockets or WebSocket, with the same
//! frame format everywhere.
//!
//! # Crate Structure
//!
//! - [`transport`]: endpoints, listeners and byte streams
//! - [`frame`]: the wire frame codec
//! - [`channel`]: request/reply and publish/subscribe channels
//! - [`selector`]: build channels from a [`TransportConfig`] by transport name
//! - [`wrap`]: tracing and blocking adapters around any channel
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use fleetwire::{selector, RequestChannel, TransportConfig};
//!
//! # async fn demo() -> fleetwire::Result<()> {
//! let config = TransportConfig::from_json_str(r#"{"transport": "ipc"}"#)?;
//! let client = selector::request_client(&config)?;
//! let reply = client
//!     .send(serde_json::json!({"cmd": "ping"}), 3, Duration::from_secs(5))
//!     .await?;
//! println!("{reply}");
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod selector;
pub mod wrap;

/// Re-export transport types.
pub mod transport {
    pub use fleetwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use fleetwire_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use fleetwire_channel::*;
}

pub use fleetwire_channel::{
    handler_fn, Binding, ChannelError, ClearText, ConnectionCallback, CryptError, Dispatch,
    IpcClient, IpcServer, MessageCallback, PayloadCrypt, ProcessManager, PublishChannel,
    PublishClient, PublishReport, PublishServer, PublishService, RequestChannel, RequestClient,
    RequestHandler, RequestServer, RequestService, Result, TaskManager, TransportConfig,
};
pub use fleetwire_frame::Message;
pub use fleetwire_transport::{Endpoint, LocalAddr};
