use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::codec::{encode_frame, Frame, FrameConfig, Head, Message, HEADER_SIZE};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `AsyncWrite` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: AsyncWrite + Unpin> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete frame and flush.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.buf.clear();
        encode_frame(frame, &mut self.buf)?;

        let payload_len = self.buf.len() - HEADER_SIZE;
        if payload_len > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: self.config.max_payload_size,
            });
        }

        write_all_flush(&mut self.inner, &self.buf).await
    }

    /// Encode and send a body with an optional head.
    pub async fn send(&mut self, body: &Message, head: Option<&Head>) -> Result<()> {
        let frame = Frame {
            head: head.cloned().unwrap_or_default(),
            body: body.clone(),
        };
        self.write_frame(&frame).await
    }

    /// Write bytes that already hold one or more encoded frames.
    ///
    /// Used by fan-out paths that encode once and write many times.
    pub async fn write_encoded(&mut self, wire: &[u8]) -> Result<()> {
        write_all_flush(&mut self.inner, wire).await
    }

    /// Flush the underlying stream.
    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await.map_err(FrameError::Io)
    }

    /// Shut down the write side of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(FrameError::Io)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

async fn write_all_flush<T: AsyncWrite + Unpin>(inner: &mut T, wire: &[u8]) -> Result<()> {
    match inner.write_all(wire).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::WriteZero => {
            return Err(FrameError::ConnectionClosed)
        }
        Err(err) => return Err(FrameError::Io(err)),
    }
    inner.flush().await.map_err(FrameError::Io)
}
