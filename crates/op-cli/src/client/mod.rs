//! Reflection-driven gRPC client engine.
//!
//! Connects to any holon over any transport, discovers the target method
//! through server reflection, builds dynamic request/response messages,
//! and marshals protobuf ↔ JSON both ways. No generated client code is
//! involved: the schema is learned at call time.

pub mod codec;
pub mod reflection;
pub mod stdio;
pub mod ws;

use std::future::{ready, Ready};
use std::io;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use prost_reflect::{DynamicMessage, MethodDescriptor, ServiceDescriptor};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::Status;

use codec::DynamicCodec;
use reflection::{is_reflection_service, resolve_service, ReflectionStream};

/// Budget for one full logical call: dial + reflect + invoke.
pub const INVOKE_DEADLINE: Duration = Duration::from_secs(10);

/// Budget for a reflection-only method listing.
pub const LIST_DEADLINE: Duration = Duration::from_secs(5);

/// Errors raised by the client engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Dialing the server failed.
    #[error("connect to {address}: {source}")]
    Connect {
        /// The target address or URI.
        address: String,
        /// Underlying transport failure.
        source: tonic::transport::Error,
    },

    /// The server does not expose the reflection service.
    #[error("reflection not available: {0}")]
    ReflectionUnavailable(#[source] Status),

    /// A reflection stream exchange failed.
    #[error("reflection stream: {0}")]
    Stream(#[source] Status),

    /// The reflection stream ended mid-conversation.
    #[error("reflection stream closed unexpectedly")]
    StreamClosed,

    /// The server answered a reflection request with an error payload.
    #[error("reflection error: {message}")]
    ReflectionError {
        /// The server's error message.
        message: String,
    },

    /// The server answered with a response type the request cannot have.
    #[error("unexpected reflection response")]
    UnexpectedResponse,

    /// The server exposed no services at all.
    #[error("no services found")]
    NoServices,

    /// No file descriptor came back for a symbol or filename.
    #[error("no file descriptor for {symbol}")]
    NoFileDescriptor {
        /// The symbol or filename that was requested.
        symbol: String,
    },

    /// A descriptor blob failed to parse.
    #[error("unmarshal descriptor {what}: {source}")]
    DecodeDescriptor {
        /// The symbol or filename being decoded.
        what: String,
        /// Underlying decode failure.
        source: prost::DecodeError,
    },

    /// The stitched descriptor set does not form a valid schema.
    #[error("build file descriptors: {0}")]
    BuildDescriptors(#[source] prost_reflect::DescriptorError),

    /// The compiled pool has no such service.
    #[error("find service {name}: not found")]
    ServiceNotFound {
        /// The fully qualified service name.
        name: String,
    },

    /// No service exposes the requested method.
    #[error("method {method:?} not found. Available: {available:?}")]
    MethodNotFound {
        /// The method that was requested.
        method: String,
        /// Every `<service>/<method>` pair the server exposes.
        available: Vec<String>,
    },

    /// The user's input JSON does not match the request schema.
    #[error("parse input JSON: {0}")]
    InputJson(#[source] serde_json::Error),

    /// The response could not be marshalled to JSON.
    #[error("marshal output: {0}")]
    OutputJson(#[source] serde_json::Error),

    /// The RPC path was not a valid URI segment.
    #[error("invalid method path {path}: {source}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Underlying parse failure.
        source: http::uri::InvalidUri,
    },

    /// The callee surfaced an RPC error.
    #[error("call {path}: {source}")]
    Rpc {
        /// The full method path.
        path: String,
        /// The gRPC status.
        source: Status,
    },

    /// The channel never became ready.
    #[error("transport not ready: {0}")]
    NotReady(#[source] tonic::transport::Error),

    /// Subprocess management failed underneath the call.
    #[error(transparent)]
    Process(#[from] op_core::process::ProcessError),

    /// The invocation-scoped deadline elapsed.
    #[error("call timed out after {secs}s")]
    Timeout {
        /// The deadline that elapsed, in seconds.
        secs: u64,
    },

    /// The WebSocket handshake failed.
    #[error("websocket dial {uri}: {source}")]
    WebSocket {
        /// The WebSocket URI.
        uri: String,
        /// Underlying handshake failure.
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
}

/// The outcome of one dynamic call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CallResult {
    /// Fully qualified service name that answered.
    pub service: String,
    /// Simple method name that was invoked.
    pub method: String,
    /// Pretty proto-JSON response body.
    pub output: String,
}

/// Reduces `svc/Method` (or a bare method) to the simple method name.
#[must_use]
pub fn canonical_method_name(method: &str) -> &str {
    let trimmed = method.trim();
    match trimmed.rfind('/') {
        Some(i) if i + 1 < trimmed.len() => &trimmed[i + 1..],
        _ => trimmed,
    }
}

/// A connector that yields its connection exactly once.
///
/// Pipe- and WebSocket-backed transports cannot multiplex a second
/// physical channel; if the gRPC channel tries to reconnect, the dial
/// must fail rather than hang.
pub struct SingleUseConnector<T> {
    label: &'static str,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> SingleUseConnector<T> {
    /// Wraps `io`; `label` names the transport in the reuse error.
    pub fn new(label: &'static str, io: T) -> Self {
        Self {
            label,
            slot: Arc::new(Mutex::new(Some(io))),
        }
    }
}

impl<T> tower::Service<Uri> for SingleUseConnector<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Response = TokioIo<T>;
    type Error = io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let taken = self.slot.lock().unwrap_or_else(|p| p.into_inner()).take();
        ready(match taken {
            Some(io) => Ok(TokioIo::new(io)),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} already consumed", self.label),
            )),
        })
    }
}

/// Dials a TCP gRPC server at `host:port`.
///
/// # Errors
///
/// Fails when the endpoint is malformed or the connection cannot be
/// established.
pub async fn dial_tcp(address: &str) -> Result<Channel, ClientError> {
    let endpoint =
        Endpoint::from_shared(format!("http://{address}")).map_err(|source| ClientError::Connect {
            address: address.to_string(),
            source,
        })?;
    endpoint
        .connect()
        .await
        .map_err(|source| ClientError::Connect {
            address: address.to_string(),
            source,
        })
}

/// Dials a gRPC server over a Unix-domain socket.
///
/// # Errors
///
/// Fails when the socket cannot be connected.
pub async fn dial_unix(path: &str) -> Result<Channel, ClientError> {
    let socket_path = std::path::PathBuf::from(path);
    let connector = tower::service_fn(move |_: Uri| {
        let socket_path = socket_path.clone();
        async move {
            Ok::<_, io::Error>(TokioIo::new(
                tokio::net::UnixStream::connect(socket_path).await?,
            ))
        }
    });

    Endpoint::from_static("http://unix.localhost")
        .connect_with_connector(connector)
        .await
        .map_err(|source| ClientError::Connect {
            address: format!("unix://{path}"),
            source,
        })
}

/// Dials over an already-established single-use connection. The connect
/// is blocking so the HTTP/2 handshake happens on the unique connection
/// up front.
///
/// # Errors
///
/// Fails when the handshake over the connection fails.
pub async fn dial_single_use<T>(io: T, label: &'static str) -> Result<Channel, ClientError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    Endpoint::from_static("http://pipe.localhost")
        .connect_with_connector(SingleUseConnector::new(label, io))
        .await
        .map_err(|source| ClientError::Connect {
            address: label.to_string(),
            source,
        })
}

/// Discovers `method_name` through reflection and invokes it with
/// `input_json`.
///
/// Matching is by simple method name across every non-reflection service;
/// `svc/Method` inputs match on the suffix only. Services whose
/// descriptors fail to resolve are skipped (logged), not fatal.
///
/// # Errors
///
/// Fails when reflection is unavailable, the method cannot be found
/// (listing what is available), the input JSON is invalid, or the RPC
/// itself errors.
pub async fn call(
    channel: Channel,
    method_name: &str,
    input_json: &str,
) -> Result<CallResult, ClientError> {
    let mut stream = ReflectionStream::open(channel.clone()).await?;

    let services = stream.list_services().await?;
    if services.is_empty() {
        return Err(ClientError::NoServices);
    }

    let target = canonical_method_name(method_name);
    let mut available = Vec::new();

    for service_name in services.iter().filter(|s| !is_reflection_service(s)) {
        let service = match resolve_service(&mut stream, service_name).await {
            Ok(service) => service,
            Err(err) => {
                tracing::warn!(service = %service_name, %err, "descriptor resolution failed");
                continue;
            }
        };

        for method in service.methods() {
            available.push(format!("{}/{}", service.full_name(), method.name()));
            if method.name() == target {
                return invoke(channel, &service, &method, input_json).await;
            }
        }
    }

    Err(ClientError::MethodNotFound {
        method: method_name.to_string(),
        available,
    })
}

/// Lists every `<service>/<method>` pair the server exposes.
///
/// # Errors
///
/// Fails when reflection is unavailable or the listing exchange fails.
pub async fn list_methods(channel: Channel) -> Result<Vec<String>, ClientError> {
    let mut stream = ReflectionStream::open(channel).await?;
    let services = stream.list_services().await?;

    let mut methods = Vec::new();
    for service_name in services.iter().filter(|s| !is_reflection_service(s)) {
        let service = match resolve_service(&mut stream, service_name).await {
            Ok(service) => service,
            Err(err) => {
                tracing::warn!(service = %service_name, %err, "descriptor resolution failed");
                continue;
            }
        };
        for method in service.methods() {
            methods.push(format!("{}/{}", service.full_name(), method.name()));
        }
    }
    Ok(methods)
}

/// Invokes one resolved method with a dynamic request built from JSON.
async fn invoke(
    channel: Channel,
    service: &ServiceDescriptor,
    method: &MethodDescriptor,
    input_json: &str,
) -> Result<CallResult, ClientError> {
    let mut trimmed = input_json.trim();
    if trimmed.is_empty() {
        trimmed = "{}";
    }

    let mut deserializer = serde_json::Deserializer::from_str(trimmed);
    let request = DynamicMessage::deserialize(method.input(), &mut deserializer)
        .map_err(ClientError::InputJson)?;
    deserializer.end().map_err(ClientError::InputJson)?;

    let path = format!("/{}/{}", service.full_name(), method.name());
    let path_and_query = http::uri::PathAndQuery::try_from(path.as_str()).map_err(|source| {
        ClientError::InvalidPath {
            path: path.clone(),
            source,
        }
    })?;

    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready().await.map_err(ClientError::NotReady)?;

    let response = grpc
        .unary(
            tonic::Request::new(request),
            path_and_query,
            DynamicCodec::new(method.clone()),
        )
        .await
        .map_err(|source| ClientError::Rpc {
            path: path.clone(),
            source,
        })?;

    let raw = serde_json::to_string(&response.into_inner()).map_err(ClientError::OutputJson)?;

    Ok(CallResult {
        service: service.full_name().to_string(),
        method: method.name().to_string(),
        output: pretty_json(&raw),
    })
}

// Pretty-printing is best effort; the raw marshalled JSON is already
// correct.
fn pretty_json(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use op_core::identity::{write_holon_md, Identity, MANIFEST_NAME};
    use op_core::proto::op::v1 as pb;
    use op_core::server::OpServer;
    use op_core::transport;

    /// Serves the op service (with v1alpha reflection) on a loopback
    /// port and returns the address.
    async fn spawn_reflective_server() -> String {
        let listener = transport::listen("tcp://127.0.0.1:0").await.unwrap();
        let address = listener.description().to_string();
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
            .build_v1alpha()
            .unwrap();
        tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(OpServer.into_service())
                .add_service(reflection)
                .serve_with_incoming(listener.into_incoming()),
        );
        address
    }

    async fn dial_with_retry(address: &str) -> Channel {
        for _ in 0..50 {
            if let Ok(channel) = dial_tcp(address).await {
                return channel;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("server at {address} never became dialable");
    }

    #[tokio::test]
    async fn reflection_roundtrip_against_own_server() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("who");
        std::fs::create_dir_all(&dir).unwrap();
        let id = Identity {
            uuid: "client-roundtrip-who".to_string(),
            given_name: "who".to_string(),
            family_name: "Holon".to_string(),
            lang: "go".to_string(),
            ..Identity::default()
        };
        write_holon_md(&id, &dir.join(MANIFEST_NAME)).unwrap();

        let address = spawn_reflective_server().await;
        let channel = dial_with_retry(&address).await;

        let input = format!(r#"{{"rootDir":"{}"}}"#, tmp.path().display());
        let result = call(channel, "ListIdentities", &input).await.unwrap();

        assert_eq!(result.service, "op.v1.OpService");
        assert_eq!(result.method, "ListIdentities");
        assert!(result.output.contains("client-roundtrip-who"), "{}", result.output);
        // Output is valid pretty proto-JSON.
        let parsed: serde_json::Value = serde_json::from_str(&result.output).unwrap();
        assert!(parsed["entries"].is_array());
    }

    #[tokio::test]
    async fn qualified_method_path_matches_suffix() {
        let address = spawn_reflective_server().await;
        let channel = dial_with_retry(&address).await;

        let result = call(channel, "op.v1.OpService/ListIdentities", r#"{"rootDir":"/nonexistent-root"}"#).await;
        // The scan of a missing root is a server-side error, which proves
        // the method itself was matched and invoked.
        match result {
            Err(ClientError::Rpc { path, .. }) => {
                assert_eq!(path, "/op.v1.OpService/ListIdentities");
            }
            other => panic!("expected an RPC error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_method_lists_available() {
        let address = spawn_reflective_server().await;
        let channel = dial_with_retry(&address).await;

        let err = call(channel, "Teleport", "{}").await.unwrap_err();
        match err {
            ClientError::MethodNotFound { method, available } => {
                assert_eq!(method, "Teleport");
                assert!(available.contains(&"op.v1.OpService/ListIdentities".to_string()));
                assert!(available.contains(&"op.v1.OpService/Discover".to_string()));
            }
            other => panic!("expected MethodNotFound, got {other}"),
        }
    }

    #[tokio::test]
    async fn bad_input_json_is_rejected_before_the_wire() {
        let address = spawn_reflective_server().await;
        let channel = dial_with_retry(&address).await;

        let err = call(channel, "ListIdentities", r#"{"noSuchField":true}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InputJson(_)));
    }

    #[tokio::test]
    async fn list_methods_enumerates_services() {
        let address = spawn_reflective_server().await;
        let channel = dial_with_retry(&address).await;

        let methods = list_methods(channel).await.unwrap();
        assert!(methods.contains(&"op.v1.OpService/CreateIdentity".to_string()));
        assert!(methods.contains(&"op.v1.OpService/PinVersion".to_string()));
        // The reflection service itself is not listed.
        assert!(methods.iter().all(|m| !m.contains("ServerReflection")));
    }

    #[test]
    fn canonical_name_strips_service_path() {
        assert_eq!(canonical_method_name("ListIdentities"), "ListIdentities");
        assert_eq!(
            canonical_method_name("op.v1.OpService/ListIdentities"),
            "ListIdentities"
        );
        assert_eq!(canonical_method_name("  Spaced  "), "Spaced");
        assert_eq!(canonical_method_name("trailing/"), "trailing/");
    }

    #[test]
    fn pretty_json_falls_back_to_raw() {
        assert_eq!(pretty_json("not json"), "not json");
        let pretty = pretty_json(r#"{"a":1}"#);
        assert!(pretty.contains("\n"));
        assert!(pretty.contains("\"a\": 1"));
    }

    #[tokio::test]
    async fn single_use_connector_yields_exactly_once() {
        let (a, _b) = tokio::io::duplex(64);
        let mut connector = SingleUseConnector::new("stdio pipe", a);
        let uri: Uri = "http://pipe.localhost".parse().unwrap();

        let first = tower::Service::call(&mut connector, uri.clone()).await;
        assert!(first.is_ok());

        let second = tower::Service::call(&mut connector, uri).await;
        let err = second.unwrap_err();
        assert!(err.to_string().contains("already consumed"), "{err}");
        assert!(err.to_string().contains("stdio pipe"));
    }
}
