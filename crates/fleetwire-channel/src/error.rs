use std::time::Duration;

use fleetwire_transport::Endpoint;

use crate::crypt::CryptError;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Invalid configuration: unknown transport, bad pool name, conflicting options.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The peer could not be reached before the connect deadline.
    #[error("could not connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: fleetwire_transport::TransportError,
    },

    /// No correlated reply arrived within any attempt.
    #[error("no reply after {tries} attempt(s) of {timeout:?}")]
    Timeout { tries: u32, timeout: Duration },

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] fleetwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] fleetwire_frame::FrameError),

    /// Authentication failed, including after one re-authentication.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The payload crypt collaborator failed for a reason other than auth.
    #[error("payload crypt error: {0}")]
    Crypt(String),

    /// The connection dropped while a call was outstanding.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// The channel has been closed.
    #[error("channel closed")]
    Closed,

    /// Poll-mode receive was attempted while a callback is registered.
    #[error("recv unavailable: {0}")]
    ReceiveMode(&'static str),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CryptError> for ChannelError {
    fn from(err: CryptError) -> Self {
        match err {
            CryptError::Auth(msg) => Self::Auth(msg),
            CryptError::Other(msg) => Self::Crypt(msg),
        }
    }
}

impl ChannelError {
    /// Whether a request attempt that failed this way may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Disconnected(_) | Self::Connect { .. } => true,
            Self::Transport(err) => err.is_retryable(),
            Self::Frame(fleetwire_frame::FrameError::Io(_))
            | Self::Frame(fleetwire_frame::FrameError::ConnectionClosed) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
