use bytes::BytesMut;
use tracing::debug;

use crate::codec::{decode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD};
use crate::error::Result;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Incremental frame decoder.
///
/// Bytes may be fed in any chunking (including one byte at a time or empty
/// slices); complete frames come out in wire order.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: usize,
    eof: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder with the default payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Create a decoder from a frame configuration.
    pub fn with_config(config: &FrameConfig) -> Self {
        Self::with_max_payload(config.max_payload_size)
    }

    /// Create a decoder with an explicit payload limit.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_payload,
            eof: false,
        }
    }

    /// Append received bytes. Ignored after [`mark_eof`](Self::mark_eof).
    pub fn feed(&mut self, data: &[u8]) {
        if self.eof || data.is_empty() {
            return;
        }
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if any.
    ///
    /// After end-of-stream, frames already complete in the buffer are still
    /// returned; any incomplete tail is discarded and `Ok(None)` is final.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = decode_frame(&mut self.buf, self.max_payload)?;
        if frame.is_none() && self.eof && !self.buf.is_empty() {
            debug!(
                discarded = self.buf.len(),
                "discarding incomplete frame at end of stream"
            );
            self.buf.clear();
        }
        Ok(frame)
    }

    /// Iterate over every frame that is complete right now, consuming them.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            decoder: self,
            failed: false,
        }
    }

    /// Declare that the peer closed the stream.
    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    /// Whether end-of-stream has been declared.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Whether the stream ended and every frame has been drained.
    pub fn is_finished(&self) -> bool {
        self.eof && self.buf.is_empty()
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }
}

/// Lazy iterator over the complete frames buffered in a [`FrameDecoder`].
///
/// Stops after the first error.
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.decoder.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use serde_json::json;

    use super::*;
    use crate::codec::{encode_frame, Message, HEADER_SIZE};
    use crate::error::FrameError;

    fn sample_messages() -> Vec<Message> {
        vec![
            json!({"cmd": "ping"}),
            json!([1, 2, 3]),
            json!("plain string"),
            json!({"load": {"fun": "state.apply", "arg": ["web"], "tgt": "*"}}),
            json!(null),
        ]
    }

    fn wire_for(messages: &[Message]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (i, body) in messages.iter().enumerate() {
            let mut frame = Frame::new(body.clone());
            frame.set_message_id(i as u64 + 1);
            encode_frame(&frame, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn decodes_identically_for_every_chunk_size() {
        let messages = sample_messages();
        let wire = wire_for(&messages);

        for chunk_size in 1..=wire.len() {
            let mut decoder = FrameDecoder::new();
            let mut out = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                decoder.feed(chunk);
                for frame in decoder.frames() {
                    out.push(frame.unwrap());
                }
            }

            let bodies: Vec<Message> = out.iter().map(|f| f.body.clone()).collect();
            assert_eq!(bodies, messages, "chunk size {chunk_size}");
            let mids: Vec<Option<u64>> = out.iter().map(Frame::message_id).collect();
            assert_eq!(mids, (1..=5).map(Some).collect::<Vec<_>>());
        }
    }

    #[test]
    fn byte_at_a_time_yields_frame_only_on_last_byte() {
        let wire = wire_for(&[json!({"foo": "bar"})]);
        let mut decoder = FrameDecoder::new();

        for (i, byte) in wire.iter().enumerate() {
            decoder.feed(std::slice::from_ref(byte));
            let frame = decoder.next_frame().unwrap();
            if i + 1 < wire.len() {
                assert!(frame.is_none(), "frame surfaced early at byte {i}");
            } else {
                assert_eq!(frame.unwrap().body, json!({"foo": "bar"}));
            }
        }
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn empty_feed_yields_nothing() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[]);
        assert!(decoder.frames().next().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn eof_discards_partial_tail_but_keeps_complete_frames() {
        let mut wire = wire_for(&[json!("complete")]);
        let tail = wire_for(&[json!("truncated")]);
        wire.extend_from_slice(&tail[..HEADER_SIZE + 1]);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&wire);
        decoder.mark_eof();

        let frames: Vec<_> = decoder.frames().collect::<Result<_>>().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].body, json!("complete"));
        assert!(decoder.is_finished());

        decoder.feed(b"more after eof");
        assert_eq!(decoder.buffered(), 0);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn frames_iterator_stops_after_error() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0u8; 16]);

        let mut frames = decoder.frames();
        assert!(matches!(frames.next(), Some(Err(FrameError::InvalidMagic))));
        assert!(frames.next().is_none());
    }

    #[test]
    fn respects_max_payload() {
        let wire = wire_for(&[json!("x".repeat(256))]);
        let mut decoder = FrameDecoder::with_max_payload(64);
        decoder.feed(&wire);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::PayloadTooLarge { max: 64, .. })
        ));
    }
}
