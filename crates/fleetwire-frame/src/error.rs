/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x4657 \"FW\")")]
    InvalidMagic,

    /// The frame header announces a wire version this build does not speak.
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u16),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The message could not be serialized into a frame payload.
    #[error("frame encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A complete frame arrived but its payload is not a valid envelope.
    ///
    /// The frame bytes have already been consumed, so the stream stays
    /// aligned and the next frame can still be decoded.
    #[error("frame decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame could be written.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether the byte stream is still aligned on a frame boundary.
    ///
    /// A desynchronized stream cannot be recovered; the connection must be
    /// dropped.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::UnsupportedVersion(_))
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
