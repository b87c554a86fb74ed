use std::fmt;
use std::io;

use fleetwire_channel::ChannelError;
use fleetwire_frame::FrameError;
use fleetwire_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::NotFound
        | io::ErrorKind::AddrInUse => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidEndpoint(_) | TransportError::PathTooLong { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } | FrameError::Encode(_) | FrameError::Decode(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn channel_error(context: &str, err: ChannelError) -> CliError {
    match err {
        ChannelError::Config(_) | ChannelError::ReceiveMode(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        ChannelError::Connect { source, .. } | ChannelError::Transport(source) => {
            transport_error(context, source)
        }
        ChannelError::Frame(err) => frame_error(context, err),
        ChannelError::Timeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        ChannelError::Auth(_) => CliError::new(PERMISSION_DENIED, format!("{context}: {err}")),
        ChannelError::Crypt(_) | ChannelError::Json(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        ChannelError::Disconnected(_) | ChannelError::Closed => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn channel_errors_map_to_exit_codes() {
        let code = |err| channel_error("test", err).code;
        assert_eq!(code(ChannelError::Config("bad".into())), USAGE);
        assert_eq!(
            code(ChannelError::Timeout {
                tries: 3,
                timeout: Duration::from_secs(1)
            }),
            TIMEOUT
        );
        assert_eq!(code(ChannelError::Auth("denied".into())), PERMISSION_DENIED);
        assert_eq!(code(ChannelError::Closed), FAILURE);
        assert_eq!(
            code(ChannelError::Transport(TransportError::InvalidEndpoint("x".into()))),
            USAGE
        );
        assert_eq!(
            code(ChannelError::Transport(TransportError::Io(io::Error::from(
                io::ErrorKind::ConnectionRefused
            )))),
            TRANSPORT_ERROR
        );
    }
}
