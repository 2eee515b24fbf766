//! A duplex connection over a child process's stdin/stdout.
//!
//! Used for the ephemeral stdio transport: the dispatcher spawns
//! `<holon> serve --listen stdio://` and speaks HTTP/2 over the pipes.
//! The readiness probe consumes the first byte of the server's HTTP/2
//! preface, so the read side replays that byte ahead of the rest of the
//! child's stdout.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{ChildStdin, ChildStdout};

/// Reads from the child's stdout (preface bytes first), writes to the
/// child's stdin.
#[derive(Debug)]
pub struct PipeConn {
    preface: Vec<u8>,
    stdout: ChildStdout,
    stdin: ChildStdin,
}

impl PipeConn {
    /// Builds the connection, replaying `preface` before the live pipe.
    #[must_use]
    pub fn new(preface: Vec<u8>, stdout: ChildStdout, stdin: ChildStdin) -> Self {
        Self {
            preface,
            stdout,
            stdin,
        }
    }
}

impl AsyncRead for PipeConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.preface.is_empty() {
            let n = buf.remaining().min(this.preface.len());
            buf.put_slice(&this.preface[..n]);
            this.preface.drain(..n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdin).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_shutdown(cx)
    }
}
