use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::Result;

/// Byte-stream view of a WebSocket connection.
///
/// Each write becomes one binary message; reads concatenate the payloads of
/// incoming binary messages. Text, ping and pong messages are skipped.
pub struct WsStream {
    inner: WebSocketStream<TcpStream>,
    pending: Bytes,
    peer: String,
    closed: bool,
}

impl WsStream {
    /// Perform the server side of the handshake, accepting only `path`.
    pub async fn accept(stream: TcpStream, path: &str) -> Result<Self> {
        let peer = peer_of(&stream);
        let expected = path.to_string();
        let check_path = move |req: &Request, resp: Response| {
            if req.uri().path() == expected {
                Ok(resp)
            } else {
                let mut reject = ErrorResponse::new(Some(format!(
                    "no websocket endpoint at {}",
                    req.uri().path()
                )));
                *reject.status_mut() = StatusCode::NOT_FOUND;
                Err(reject)
            }
        };
        let inner = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
        debug!(%peer, "websocket handshake accepted");
        Ok(Self::new(inner, peer))
    }

    /// Perform the client side of the handshake against `url`.
    pub async fn connect(stream: TcpStream, url: &str) -> Result<Self> {
        let peer = peer_of(&stream);
        let (inner, _response) = tokio_tungstenite::client_async(url, stream).await?;
        debug!(%url, "websocket handshake completed");
        Ok(Self::new(inner, peer))
    }

    fn new(inner: WebSocketStream<TcpStream>, peer: String) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            peer,
            closed: false,
        }
    }

    pub fn peer_addr(&self) -> String {
        self.peer.clone()
    }
}

fn peer_of(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "websocket".to_string())
}

fn ws_to_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(io) => io,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
        }
        other => io::Error::other(other),
    }
}

impl AsyncRead for WsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.pending = Bytes::from(data),
                Some(Ok(Message::Close(_))) | None => this.closed = true,
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    this.closed = true
                }
                Some(Err(err)) => return Poll::Ready(Err(ws_to_io(err))),
            }
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_to_io)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(ws_to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(Pin::new(&mut self.get_mut().inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(err) => Poll::Ready(Err(ws_to_io(err))),
        }
    }
}
