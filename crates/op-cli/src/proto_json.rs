//! Proto-JSON bridging for the compiled-in `op.v1` schema.
//!
//! The generated prost types carry no serde support; JSON conversion
//! goes through a dynamic message resolved against the embedded
//! descriptor set, which gives the standard proto-JSON mapping
//! (lowerCamelCase field names, enum-as-string) in both directions.

use std::sync::OnceLock;

use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage};
use thiserror::Error;

use op_core::proto::op::v1 as pb;

/// Errors raised while bridging typed messages and JSON.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtoJsonError {
    /// The embedded pool has no such message.
    #[error("unknown message type {name}")]
    UnknownMessage {
        /// The fully qualified message name.
        name: String,
    },

    /// The JSON does not match the message schema.
    #[error("parse input JSON: {0}")]
    Parse(#[source] serde_json::Error),

    /// Transcoding between dynamic and typed form failed.
    #[error("transcode {name}: {source}")]
    Transcode {
        /// The message name being transcoded.
        name: String,
        /// Underlying decode failure.
        source: prost::DecodeError,
    },

    /// Serialising the response to JSON failed.
    #[error("marshal output: {0}")]
    Marshal(#[source] serde_json::Error),
}

/// The descriptor pool for the `op.v1` package.
pub fn op_pool() -> &'static DescriptorPool {
    static POOL: OnceLock<DescriptorPool> = OnceLock::new();
    POOL.get_or_init(|| {
        DescriptorPool::decode(pb::FILE_DESCRIPTOR_SET)
            .expect("embedded op.v1 descriptor set is valid")
    })
}

/// Parses proto-JSON into the typed message `T`. Empty or whitespace
/// input parses as `{}`.
///
/// # Errors
///
/// Fails when the message name is unknown, the JSON does not match the
/// schema, or transcoding fails.
pub fn unmarshal<T: Message + Default>(
    message_name: &str,
    json: &str,
) -> Result<T, ProtoJsonError> {
    let descriptor = op_pool().get_message_by_name(message_name).ok_or_else(|| {
        ProtoJsonError::UnknownMessage {
            name: message_name.to_string(),
        }
    })?;

    let mut trimmed = json.trim();
    if trimmed.is_empty() {
        trimmed = "{}";
    }

    let mut deserializer = serde_json::Deserializer::from_str(trimmed);
    let dynamic = DynamicMessage::deserialize(descriptor, &mut deserializer)
        .map_err(ProtoJsonError::Parse)?;
    deserializer.end().map_err(ProtoJsonError::Parse)?;

    dynamic
        .transcode_to::<T>()
        .map_err(|source| ProtoJsonError::Transcode {
            name: message_name.to_string(),
            source,
        })
}

/// Marshals a typed message to pretty proto-JSON (two-space indent). A
/// pretty-printing failure falls back to compact JSON silently.
///
/// # Errors
///
/// Fails when the message name is unknown or serialisation fails.
pub fn marshal_pretty<T: Message>(message_name: &str, message: &T) -> Result<String, ProtoJsonError> {
    let descriptor = op_pool().get_message_by_name(message_name).ok_or_else(|| {
        ProtoJsonError::UnknownMessage {
            name: message_name.to_string(),
        }
    })?;

    let dynamic = DynamicMessage::decode(descriptor, message.encode_to_vec().as_slice()).map_err(
        |source| ProtoJsonError::Transcode {
            name: message_name.to_string(),
            source,
        },
    )?;

    let raw = serde_json::to_string(&dynamic).map_err(ProtoJsonError::Marshal)?;
    Ok(serde_json::from_str::<serde_json::Value>(&raw)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmarshal_uses_camel_case_names() {
        let req: pb::ListIdentitiesRequest =
            unmarshal("op.v1.ListIdentitiesRequest", r#"{"rootDir":"holons"}"#).unwrap();
        assert_eq!(req.root_dir, "holons");
    }

    #[test]
    fn unmarshal_empty_input_is_default() {
        let req: pb::ListIdentitiesRequest = unmarshal("op.v1.ListIdentitiesRequest", "  ").unwrap();
        assert_eq!(req, pb::ListIdentitiesRequest::default());
    }

    #[test]
    fn unmarshal_rejects_unknown_fields() {
        let err = unmarshal::<pb::ListIdentitiesRequest>(
            "op.v1.ListIdentitiesRequest",
            r#"{"noSuchField":1}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtoJsonError::Parse(_)));
    }

    #[test]
    fn marshal_is_pretty_and_camel_cased() {
        let resp = pb::ShowIdentityResponse {
            identity: Some(pb::HolonIdentity {
                uuid: "u-1".to_string(),
                given_name: "who".to_string(),
                ..pb::HolonIdentity::default()
            }),
            file_path: "holons/who/HOLON.md".to_string(),
            raw_content: String::new(),
        };
        let json = marshal_pretty("op.v1.ShowIdentityResponse", &resp).unwrap();
        assert!(json.contains("\"givenName\": \"who\""));
        assert!(json.contains("\"filePath\""));
    }

    #[test]
    fn unknown_message_name() {
        let err = unmarshal::<pb::ListIdentitiesRequest>("op.v1.NoSuchMessage", "{}").unwrap_err();
        assert!(matches!(err, ProtoJsonError::UnknownMessage { .. }));
    }
}
