//! In-process byte-pipe transport.
//!
//! Pairs a local gRPC server with a local client in the same address
//! space. Each [`MemDialer::dial`] mints a fresh duplex pipe: the server
//! half is delivered to the listener, the client half is returned to the
//! caller, so the gRPC channel is free to open as many physical
//! connections as it likes.

use std::io;

use futures::stream::{Stream, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::ServerConn;

const PIPE_BUFFER: usize = 64 * 1024;

/// The accepting side of an in-process pipe pair.
pub struct MemListener {
    rx: mpsc::Receiver<DuplexStream>,
}

/// The dialing side of an in-process pipe pair. Cheap to clone.
#[derive(Clone, Debug)]
pub struct MemDialer {
    tx: mpsc::Sender<DuplexStream>,
}

/// Creates a matched listener/dialer pair.
#[must_use]
pub fn pair() -> (MemListener, MemDialer) {
    let (tx, rx) = mpsc::channel(8);
    (MemListener { rx }, MemDialer { tx })
}

impl MemDialer {
    /// Mints a new pipe, hands the server half to the listener, and
    /// returns the client half.
    ///
    /// # Errors
    ///
    /// Fails with `BrokenPipe` once the listener has been dropped.
    pub async fn dial(&self) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(PIPE_BUFFER);
        self.tx
            .send(server)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mem listener closed"))?;
        Ok(client)
    }
}

impl MemListener {
    /// The stream of accepted pipe ends, ready for
    /// `serve_with_incoming`.
    pub fn into_incoming(self) -> impl Stream<Item = io::Result<ServerConn>> + Send + 'static {
        ReceiverStream::new(self.rx).map(|s| Ok(ServerConn::Mem(s)))
    }
}
