use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + length (4) + version (2) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "FW" (0x46 0x57).
pub const MAGIC: [u8; 2] = [0x46, 0x57];

/// Wire version written into every header.
pub const WIRE_VERSION: u16 = 1;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Head key carrying the request/reply correlation token.
pub const MESSAGE_ID_KEY: &str = "mid";

/// A structured message body. Arbitrary JSON-shaped data.
pub type Message = serde_json::Value;

/// Routing and correlation metadata carried alongside a body.
pub type Head = serde_json::Map<String, serde_json::Value>;

/// A decoded frame: optional head metadata plus the message body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub head: Head,
    #[serde(default)]
    pub body: Message,
}

#[derive(Serialize)]
struct FrameRef<'a> {
    head: &'a Head,
    body: &'a Message,
}

impl Frame {
    /// Create a frame with an empty head.
    pub fn new(body: impl Into<Message>) -> Self {
        Self {
            head: Head::new(),
            body: body.into(),
        }
    }

    /// Create a frame with an explicit head.
    pub fn with_head(body: impl Into<Message>, head: Head) -> Self {
        Self {
            head,
            body: body.into(),
        }
    }

    /// The correlation token in `head.mid`, if present.
    pub fn message_id(&self) -> Option<u64> {
        self.head.get(MESSAGE_ID_KEY).and_then(|mid| mid.as_u64())
    }

    /// Stamp a correlation token into the head.
    pub fn set_message_id(&mut self, mid: u64) {
        self.head.insert(MESSAGE_ID_KEY.to_string(), mid.into());
    }

    /// Consume the frame and return the body.
    pub fn into_body(self) -> Message {
        self.body
    }
}

/// Encode a frame into the wire format, appending to `dst`.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬──────────┬─────────────────────────┐
/// │ Magic (2B)   │ Length    │ Version  │ Payload                 │
/// │ 0x46 0x57    │ (4B LE)   │ (2B LE)  │ msgpack {head, body}    │
/// │ "FW"         │           │          │                         │
/// └──────────────┴───────────┴──────────┴─────────────────────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    encode_parts(&frame.head, &frame.body, dst)
}

/// Encode a message and optional head into a standalone wire buffer.
pub fn encode(body: &Message, head: Option<&Head>) -> Result<Bytes> {
    let empty = Head::new();
    let mut dst = BytesMut::new();
    encode_parts(head.unwrap_or(&empty), body, &mut dst)?;
    Ok(dst.freeze())
}

fn encode_parts(head: &Head, body: &Message, dst: &mut BytesMut) -> Result<()> {
    let start = dst.len();
    dst.reserve(HEADER_SIZE + 64);
    dst.put_slice(&MAGIC);
    dst.put_u32_le(0);
    dst.put_u16_le(WIRE_VERSION);

    let mut payload = (&mut *dst).writer();
    if let Err(err) = rmp_serde::encode::write_named(&mut payload, &FrameRef { head, body }) {
        dst.truncate(start);
        return Err(FrameError::Encode(err));
    }

    let payload_len = dst.len() - start - HEADER_SIZE;
    if payload_len > u32::MAX as usize {
        dst.truncate(start);
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: u32::MAX as usize,
        });
    }
    dst[start + 2..start + 6].copy_from_slice(&(payload_len as u32).to_le_bytes());
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. A payload that
/// fails to deserialize is consumed too and reported as
/// [`FrameError::Decode`].
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let version = u16::from_le_bytes([src[6], src[7]]);

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len);

    if version != WIRE_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let frame: Frame = rmp_serde::from_slice(&payload)?;
    Ok(Some(frame))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
