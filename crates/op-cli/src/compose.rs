//! In-process composition of holons the dispatcher can host itself.
//!
//! When the selector answers `mem`, the dispatcher does not spawn
//! anything: a lazily created gRPC server exposing a locally registered
//! adapter is paired with the caller through in-memory byte pipes. One
//! (listener, server) pair exists per composable holon; all aliases of a
//! holon share it, and entries live for the rest of the invocation.
//!
//! The typed client dispatches on the method's simple name; only the
//! identity-management surface is composable today.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use hyper_util::rt::TokioIo;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::Status;

use op_core::proto::op::v1 as pb;
use op_core::proto::op::v1::op_service_client::OpServiceClient;
use op_core::server::OpServer;
use op_core::transport::{self, MemDialer};

use crate::client::canonical_method_name;
use crate::proto_json::{self, ProtoJsonError};

/// Errors raised by in-memory composition.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ComposeError {
    /// No in-process adapter is registered for the holon.
    #[error("mem composition not available for holon {name:?}")]
    NotComposable {
        /// The holon name.
        name: String,
    },

    /// The in-memory channel could not be established.
    #[error("dial mem composition for {name:?}: {source}")]
    Dial {
        /// The holon name.
        name: String,
        /// Underlying transport failure.
        source: tonic::transport::Error,
    },

    /// The method is not part of the composable surface.
    #[error("method {method:?} not found via mem")]
    MethodNotFound {
        /// The requested method.
        method: String,
    },

    /// JSON bridging failed.
    #[error(transparent)]
    Json(#[from] ProtoJsonError),

    /// The adapter returned an RPC error.
    #[error("{0}")]
    Rpc(Status),
}

/// Composable holon names and the composer group they share.
const COMPOSABLE: &[(&str, &str)] = &[
    ("who", "sophia-who"),
    ("sophia", "sophia-who"),
    ("sophia-who", "sophia-who"),
];

fn composer_group(holon_name: &str) -> Option<&'static str> {
    let key = holon_name.trim().to_lowercase();
    COMPOSABLE
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, group)| *group)
}

/// Returns true when the dispatcher carries an in-process adapter for
/// the holon.
#[must_use]
pub fn is_composable(holon_name: &str) -> bool {
    composer_group(holon_name).is_some()
}

fn registry() -> &'static Mutex<HashMap<&'static str, MemDialer>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, MemDialer>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Clears the composer registry. Test hook only: running servers wind
/// down once their listeners drop.
#[doc(hidden)]
pub fn reset_for_tests() {
    registry()
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .clear();
}

// Lazy once-init per group: the first touch creates the pair and spawns
// the server task; later dials reuse the dialer.
fn composer_dialer(group: &'static str) -> MemDialer {
    let mut map = registry().lock().unwrap_or_else(|p| p.into_inner());
    map.entry(group)
        .or_insert_with(|| {
            let (listener, dialer) = transport::mem::pair();
            tokio::spawn(async move {
                let result = tonic::transport::Server::builder()
                    .add_service(OpServer.into_service())
                    .serve_with_incoming(listener.into_incoming())
                    .await;
                if let Err(err) = result {
                    tracing::warn!(%err, "mem composition server exited");
                }
            });
            dialer
        })
        .clone()
}

async fn dial_mem(holon_name: &str) -> Result<Channel, ComposeError> {
    let group = composer_group(holon_name).ok_or_else(|| ComposeError::NotComposable {
        name: holon_name.to_string(),
    })?;
    let dialer = composer_dialer(group);

    let connector = tower::service_fn(move |_: Uri| {
        let dialer = dialer.clone();
        async move { dialer.dial().await.map(TokioIo::new) }
    });

    Endpoint::from_static("http://mem.localhost")
        .connect_with_connector(connector)
        .await
        .map_err(|source| ComposeError::Dial {
            name: holon_name.to_string(),
            source,
        })
}

/// Calls `method` on the in-process adapter for `holon_name`, with
/// proto-JSON in and pretty proto-JSON out.
///
/// # Errors
///
/// Fails when the holon is not composable, the method is outside the
/// composable surface, the JSON does not match the schema, or the
/// adapter errors.
pub async fn call_via_mem(
    holon_name: &str,
    method: &str,
    input_json: &str,
) -> Result<String, ComposeError> {
    let channel = dial_mem(holon_name).await?;
    let mut client = OpServiceClient::new(channel);

    match canonical_method_name(method) {
        "CreateIdentity" => {
            let req: pb::CreateIdentityRequest =
                proto_json::unmarshal("op.v1.CreateIdentityRequest", input_json)?;
            let resp = client
                .create_identity(req)
                .await
                .map_err(ComposeError::Rpc)?
                .into_inner();
            Ok(proto_json::marshal_pretty("op.v1.CreateIdentityResponse", &resp)?)
        }
        "ListIdentities" => {
            let req: pb::ListIdentitiesRequest =
                proto_json::unmarshal("op.v1.ListIdentitiesRequest", input_json)?;
            let resp = client
                .list_identities(req)
                .await
                .map_err(ComposeError::Rpc)?
                .into_inner();
            Ok(proto_json::marshal_pretty("op.v1.ListIdentitiesResponse", &resp)?)
        }
        "ShowIdentity" => {
            let req: pb::ShowIdentityRequest =
                proto_json::unmarshal("op.v1.ShowIdentityRequest", input_json)?;
            let resp = client
                .show_identity(req)
                .await
                .map_err(ComposeError::Rpc)?
                .into_inner();
            Ok(proto_json::marshal_pretty("op.v1.ShowIdentityResponse", &resp)?)
        }
        "PinVersion" => {
            let req: pb::PinVersionRequest =
                proto_json::unmarshal("op.v1.PinVersionRequest", input_json)?;
            let resp = client
                .pin_version(req)
                .await
                .map_err(ComposeError::Rpc)?
                .into_inner();
            Ok(proto_json::marshal_pretty("op.v1.PinVersionResponse", &resp)?)
        }
        _ => Err(ComposeError::MethodNotFound {
            method: method.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use op_core::identity::{write_holon_md, Identity, MANIFEST_NAME};

    #[test]
    fn composable_names_share_one_group() {
        assert!(is_composable("who"));
        assert!(is_composable("WHO"));
        assert!(is_composable("sophia"));
        assert!(is_composable("sophia-who"));
        assert!(!is_composable("atlas"));
    }

    #[tokio::test]
    async fn unknown_method_fails_via_mem() {
        reset_for_tests();
        let err = call_via_mem("who", "Teleport", "{}").await.unwrap_err();
        assert_eq!(err.to_string(), "method \"Teleport\" not found via mem");
    }

    #[tokio::test]
    async fn not_composable_holon_is_rejected() {
        let err = call_via_mem("atlas", "ListIdentities", "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, ComposeError::NotComposable { .. }));
    }

    #[tokio::test]
    async fn list_identities_roundtrip_through_mem() {
        reset_for_tests();

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("holons/who");
        std::fs::create_dir_all(&dir).unwrap();
        let id = Identity {
            uuid: "mem-test-who".to_string(),
            given_name: "who".to_string(),
            family_name: "Holon".to_string(),
            lang: "go".to_string(),
            ..Identity::default()
        };
        write_holon_md(&id, &dir.join(MANIFEST_NAME)).unwrap();

        let output = call_via_mem(
            "who",
            "ListIdentities",
            &format!(r#"{{"rootDir":"{}"}}"#, tmp.path().display()),
        )
        .await
        .unwrap();

        assert!(output.contains("mem-test-who"), "{output}");
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert!(parsed.get("entries").is_some());
    }

    #[tokio::test]
    async fn qualified_method_paths_match_on_suffix() {
        reset_for_tests();
        let err = call_via_mem("who", "op.v1.OpService/Teleport", "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, ComposeError::MethodNotFound { .. }));
    }
}
