//! WebSocket transport: binary frames carrying HTTP/2.
//!
//! [`WsByteStream`] adapts a tungstenite WebSocket into the
//! `AsyncRead + AsyncWrite` shape the HTTP/2 stack expects: every write
//! becomes one binary message, every binary message received is appended
//! to the read buffer. Text, ping, and pong frames are ignored; a close
//! frame reads as end-of-stream.

use std::cmp;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::BytesMut;
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::ServerConn;

/// Default upgrade path when the URI does not specify one.
pub const DEFAULT_WS_PATH: &str = "/grpc";

/// A WebSocket wrapped as a plain byte stream.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: BytesMut,
}

impl<S> WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an established WebSocket.
    #[must_use]
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
        }
    }
}

fn ws_err(err: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = cmp::min(buf.remaining(), this.read_buf.len());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.read_buf.extend_from_slice(&data),
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                // Control and text frames are not part of the byte stream.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(ws_err(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_err)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_err)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(ws_err)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(ws_err)
    }
}

/// Splits `host:port[/path]` into the socket address and the upgrade
/// path (default [`DEFAULT_WS_PATH`]).
#[must_use]
pub fn split_authority_path(rest: &str) -> (String, String) {
    match rest.find('/') {
        Some(i) => (rest[..i].to_string(), rest[i..].to_string()),
        None => (rest.to_string(), DEFAULT_WS_PATH.to_string()),
    }
}

/// Accepts TCP connections, upgrades those that hit `path`, and feeds the
/// resulting byte streams to the server.
pub(super) async fn accept_loop(
    listener: TcpListener,
    path: String,
    tx: mpsc::Sender<io::Result<ServerConn>>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        let path = path.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match upgrade(stream, &path).await {
                Ok(ws) => {
                    let _ = tx.send(Ok(ServerConn::Ws(WsByteStream::new(ws)))).await;
                }
                Err(err) => {
                    tracing::debug!(%peer, %err, "websocket upgrade failed");
                }
            }
        });
    }
}

async fn upgrade(
    stream: TcpStream,
    expected_path: &str,
) -> Result<WebSocketStream<TcpStream>, tokio_tungstenite::tungstenite::Error> {
    let expected = expected_path.to_string();
    let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != expected {
            let mut not_found = ErrorResponse::new(Some("no gRPC endpoint at this path".into()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        // Echo the requested subprotocol (clients offer "grpc").
        if let Some(proto) = req.headers().get("Sec-WebSocket-Protocol") {
            resp.headers_mut()
                .insert("Sec-WebSocket-Protocol", proto.clone());
        }
        Ok(resp)
    };
    tokio_tungstenite::accept_hdr_async(stream, callback).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn authority_path_split() {
        assert_eq!(
            split_authority_path("localhost:8080"),
            ("localhost:8080".to_string(), "/grpc".to_string())
        );
        assert_eq!(
            split_authority_path("localhost:8080/rpc"),
            ("localhost:8080".to_string(), "/rpc".to_string())
        );
    }

    #[tokio::test]
    async fn upgrade_and_exchange_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(accept_loop(listener, DEFAULT_WS_PATH.to_string(), tx));

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/grpc"))
            .await
            .unwrap();
        let mut client = WsByteStream::new(ws);
        let mut server = rx.recv().await.unwrap().unwrap();

        client.write_all(b"frame").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"frame");

        server.write_all(b"reply").await.unwrap();
        server.flush().await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn wrong_path_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        tokio::spawn(accept_loop(listener, DEFAULT_WS_PATH.to_string(), tx));

        let result = tokio_tungstenite::connect_async(format!("ws://{addr}/elsewhere")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn close_frame_reads_as_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(accept_loop(listener, DEFAULT_WS_PATH.to_string(), tx));

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/grpc"))
            .await
            .unwrap();
        let mut client = WsByteStream::new(ws);
        let mut server = rx.recv().await.unwrap().unwrap();

        client.shutdown().await.unwrap();
        let mut buf = Vec::new();
        let n = server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
