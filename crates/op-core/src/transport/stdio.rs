//! The stdio pseudo-listener.
//!
//! Wraps the process's stdin/stdout as a single gRPC connection. This is
//! how LSP servers work: the parent pipes directly to the child, no ports
//! involved. The listener yields exactly one connection and then stays
//! pending so the server keeps running until the parent tears it down.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, Stdin, Stdout};

use super::ServerConn;

/// The process's stdin/stdout as a byte-stream connection.
pub struct StdioConn {
    stdin: Stdin,
    stdout: Stdout,
}

impl StdioConn {
    fn new() -> Self {
        Self {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
        }
    }
}

impl AsyncRead for StdioConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdout).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_shutdown(cx)
    }
}

/// Yields the single stdin/stdout connection, then pends forever.
pub(super) fn incoming() -> impl Stream<Item = io::Result<ServerConn>> + Send + 'static {
    stream::once(async { Ok(ServerConn::Stdio(StdioConn::new())) }).chain(stream::pending())
}
