//! URI-based transport construction for gRPC servers and dialers.
//!
//! Every holon implements the `serve --listen <URI>` convention; this
//! module turns a transport URI into something tonic can serve on.
//!
//! Supported listener schemes:
//!
//! - `tcp://<host>:<port>` - TCP socket (empty host binds all interfaces)
//! - `unix://<path>` - Unix domain socket (stale files removed before bind)
//! - `stdio://` - stdin/stdout pipe, exactly one connection
//! - `mem://` - in-process byte pipes, dialed through a [`MemDialer`]
//! - `ws://<host>:<port>[/<path>]` - WebSocket upgrade carrying HTTP/2
//!   frames (default path `/grpc`)
//!
//! `wss://` is dialable from the client side but cannot be listened on:
//! there is no TLS server configuration surface in the command set.

pub mod mem;
pub mod pipe;
pub mod stdio;
pub mod ws;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream, UnixListenerStream};
use tonic::transport::server::Connected;

pub use mem::{MemDialer, MemListener};
pub use pipe::PipeConn;
pub use ws::WsByteStream;

use thiserror::Error;

/// The transport used when `--listen` is omitted.
pub const DEFAULT_URI: &str = "tcp://:9090";

/// Errors raised while constructing a listener.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The URI scheme is not one of the supported transports.
    #[error(
        "unsupported transport URI: {uri:?} (expected tcp://, unix://, stdio://, mem://, or ws://)"
    )]
    UnsupportedUri {
        /// The offending URI.
        uri: String,
    },

    /// Binding the listener failed.
    #[error("listen {uri}: {source}")]
    Bind {
        /// The URI that was being bound.
        uri: String,
        /// Underlying I/O failure.
        source: io::Error,
    },

    /// `wss://` requires server TLS configuration, which does not exist.
    #[error("wss:// listeners are not supported: no TLS server configuration")]
    TlsListenerUnsupported,
}

/// Returns the scheme name of a transport URI (the substring before
/// `://`), or the whole string when no separator is present.
#[must_use]
pub fn scheme(uri: &str) -> &str {
    match uri.find("://") {
        Some(i) => &uri[..i],
        None => uri,
    }
}

/// A connection accepted from any of the supported listeners.
///
/// Implements the byte-stream traits tonic needs so a single
/// `serve_with_incoming` call works across every transport. Stdio and
/// WebSocket connections have no deadline support; tonic does not ask for
/// any.
pub enum ServerConn {
    /// Accepted TCP connection.
    Tcp(TcpStream),
    /// Accepted Unix-domain connection.
    Unix(UnixStream),
    /// The process's own stdin/stdout.
    Stdio(stdio::StdioConn),
    /// One end of an in-process duplex pipe.
    Mem(DuplexStream),
    /// An upgraded WebSocket carrying binary HTTP/2 frames.
    Ws(WsByteStream<TcpStream>),
}

impl AsyncRead for ServerConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(c) => Pin::new(c).poll_read(cx, buf),
            Self::Unix(c) => Pin::new(c).poll_read(cx, buf),
            Self::Stdio(c) => Pin::new(c).poll_read(cx, buf),
            Self::Mem(c) => Pin::new(c).poll_read(cx, buf),
            Self::Ws(c) => Pin::new(c).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(c) => Pin::new(c).poll_write(cx, buf),
            Self::Unix(c) => Pin::new(c).poll_write(cx, buf),
            Self::Stdio(c) => Pin::new(c).poll_write(cx, buf),
            Self::Mem(c) => Pin::new(c).poll_write(cx, buf),
            Self::Ws(c) => Pin::new(c).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(c) => Pin::new(c).poll_flush(cx),
            Self::Unix(c) => Pin::new(c).poll_flush(cx),
            Self::Stdio(c) => Pin::new(c).poll_flush(cx),
            Self::Mem(c) => Pin::new(c).poll_flush(cx),
            Self::Ws(c) => Pin::new(c).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(c) => Pin::new(c).poll_shutdown(cx),
            Self::Unix(c) => Pin::new(c).poll_shutdown(cx),
            Self::Stdio(c) => Pin::new(c).poll_shutdown(cx),
            Self::Mem(c) => Pin::new(c).poll_shutdown(cx),
            Self::Ws(c) => Pin::new(c).poll_shutdown(cx),
        }
    }
}

impl Connected for ServerConn {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

type IncomingStream = Pin<Box<dyn Stream<Item = io::Result<ServerConn>> + Send + 'static>>;

/// A bound listener produced by [`listen`], ready to hand to tonic via
/// [`Listener::into_incoming`].
pub struct Listener {
    incoming: IncomingStream,
    dialer: Option<MemDialer>,
    description: String,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("dialer", &self.dialer)
            .field("description", &self.description)
            .finish()
    }
}

impl Listener {
    /// Consumes the listener, returning the connection stream.
    #[must_use]
    pub fn into_incoming(self) -> IncomingStream {
        self.incoming
    }

    /// For `mem://` listeners, the paired dialer. `None` otherwise.
    #[must_use]
    pub fn mem_dialer(&self) -> Option<MemDialer> {
        self.dialer.clone()
    }

    /// Human-readable description of the bound endpoint.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Parses a transport URI and binds the corresponding listener.
///
/// # Errors
///
/// Returns [`TransportError::UnsupportedUri`] for unknown schemes,
/// [`TransportError::Bind`] when the bind fails, and
/// [`TransportError::TlsListenerUnsupported`] for `wss://`.
pub async fn listen(uri: &str) -> Result<Listener, TransportError> {
    if let Some(addr) = uri.strip_prefix("tcp://") {
        let bind_addr = normalize_tcp_addr(addr);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                uri: uri.to_string(),
                source,
            })?;
        let description = listener
            .local_addr()
            .map_or_else(|_| bind_addr.clone(), |a| a.to_string());
        return Ok(Listener {
            incoming: Box::pin(TcpListenerStream::new(listener).map(|r| r.map(ServerConn::Tcp))),
            dialer: None,
            description,
        });
    }

    if let Some(path) = uri.strip_prefix("unix://") {
        // Clean up stale socket files from a previous run.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).map_err(|source| TransportError::Bind {
            uri: uri.to_string(),
            source,
        })?;
        return Ok(Listener {
            incoming: Box::pin(UnixListenerStream::new(listener).map(|r| r.map(ServerConn::Unix))),
            dialer: None,
            description: path.to_string(),
        });
    }

    if uri == "stdio://" || uri == "stdio" {
        return Ok(Listener {
            incoming: Box::pin(stdio::incoming()),
            dialer: None,
            description: "stdio://".to_string(),
        });
    }

    if uri == "mem://" || uri == "mem" {
        let (listener, dialer) = mem::pair();
        return Ok(Listener {
            incoming: Box::pin(listener.into_incoming()),
            dialer: Some(dialer),
            description: "mem://".to_string(),
        });
    }

    if let Some(rest) = uri.strip_prefix("ws://") {
        let (addr, path) = ws::split_authority_path(rest);
        let listener =
            TcpListener::bind(&addr)
                .await
                .map_err(|source| TransportError::Bind {
                    uri: uri.to_string(),
                    source,
                })?;
        let description = listener
            .local_addr()
            .map_or_else(|_| addr.clone(), |a| format!("{a}{path}"));
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(ws::accept_loop(listener, path, tx));
        return Ok(Listener {
            incoming: Box::pin(ReceiverStream::new(rx)),
            dialer: None,
            description,
        });
    }

    if uri.starts_with("wss://") {
        return Err(TransportError::TlsListenerUnsupported);
    }

    Err(TransportError::UnsupportedUri {
        uri: uri.to_string(),
    })
}

// ":9090" is accepted for parity with the holon convention; the standard
// library needs an explicit host.
fn normalize_tcp_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
