//! Self-delimiting message framing for fleetwire channels.
//!
//! Every message travels as one frame:
//! - A 2-byte magic number ("FW") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian wire version
//! - A msgpack map `{head, body}` as payload
//!
//! The same bytes flow over Unix sockets, TCP and WebSocket binary messages.
//! Callers never see partial frames: feed bytes in whatever chunks the
//! transport delivers and pull complete frames out in order.

pub mod codec;
pub mod decoder;
pub mod error;
pub mod framed;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode, encode_frame, Frame, FrameConfig, Head, Message, DEFAULT_MAX_PAYLOAD,
    HEADER_SIZE, MESSAGE_ID_KEY, WIRE_VERSION,
};
pub use decoder::{FrameDecoder, Frames};
pub use error::{FrameError, Result};
pub use framed::FrameCodec;
pub use reader::FrameReader;
pub use writer::FrameWriter;
