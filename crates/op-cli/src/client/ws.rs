//! gRPC over a client-side WebSocket.
//!
//! Dials `ws://` or `wss://`, offers the `grpc` subprotocol, wraps the
//! socket as a byte stream, and runs HTTP/2 over it as a single-use
//! connection.

use op_core::transport::WsByteStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use super::{call, dial_single_use, CallResult, ClientError};

/// Dials `ws_uri` and calls `method` over the upgraded connection.
///
/// # Errors
///
/// Fails when the handshake, the gRPC handshake over the socket, or the
/// call itself fails.
pub async fn call_via_websocket(
    ws_uri: &str,
    method: &str,
    input_json: &str,
) -> Result<CallResult, ClientError> {
    let mut request = ws_uri
        .into_client_request()
        .map_err(|source| ClientError::WebSocket {
            uri: ws_uri.to_string(),
            source: Box::new(source),
        })?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("grpc"));

    let (socket, _response) =
        tokio_tungstenite::connect_async(request)
            .await
            .map_err(|source| ClientError::WebSocket {
                uri: ws_uri.to_string(),
                source: Box::new(source),
            })?;

    let channel = dial_single_use(WsByteStream::new(socket), "ws connection").await?;
    call(channel, method, input_json).await
}
