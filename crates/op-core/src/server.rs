//! The dispatcher's own gRPC facet: `op.v1.OpService`.
//!
//! Exposes holon discovery, opaque subprocess invocation, and the
//! promoted identity operations over any transport the factory can bind.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tonic::{Request, Response, Status};

use crate::identity::{self, Identity};
use crate::proto::op::v1 as pb;
use crate::proto::op::v1::op_service_server::{OpService, OpServiceServer};
use crate::transport::{self, TransportError};
use crate::resolver;

/// Holon binaries probed on PATH during discovery.
const KNOWN_PATH_BINARIES: &[&str] = &["who", "atlas", "translate", "op"];

/// Errors raised while starting the server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServeError {
    /// The listen URI could not be bound.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The reflection service could not be built.
    #[error("register reflection: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    /// The server loop failed.
    #[error("serve: {0}")]
    Serve(#[from] tonic::transport::Error),
}

/// The `OpService` implementation.
#[derive(Debug, Default)]
pub struct OpServer;

impl OpServer {
    /// Wraps the server in the generated tonic service.
    #[must_use]
    pub fn into_service(self) -> OpServiceServer<Self> {
        OpServiceServer::new(self)
    }
}

fn to_proto(id: &Identity) -> pb::HolonIdentity {
    pb::HolonIdentity {
        uuid: id.uuid.clone(),
        given_name: id.given_name.clone(),
        family_name: id.family_name.clone(),
        motto: id.motto.clone(),
        composer: id.composer.clone(),
        clade: id.clade.clone(),
        status: id.status.clone(),
        born: id.born.clone(),
        parents: id.parents.clone(),
        reproduction: id.reproduction.clone(),
        binary_path: id.binary_path.clone(),
        binary_version: id.binary_version.clone(),
        git_tag: id.git_tag.clone(),
        git_commit: id.git_commit.clone(),
        os: id.os.clone(),
        arch: id.arch.clone(),
        dependencies: id.dependencies.clone(),
        aliases: id.aliases.clone(),
        wrapped_license: id.wrapped_license.clone(),
        generated_by: id.generated_by.clone(),
        lang: id.lang.clone(),
        proto_status: id.proto_status.clone(),
    }
}

fn relative_holon_dir(root: &Path, manifest_path: &Path) -> String {
    let dir = manifest_path.parent().unwrap_or(manifest_path);
    dir.strip_prefix(root)
        .unwrap_or(dir)
        .display()
        .to_string()
}

fn entries_under(root: &Path) -> Result<Vec<pb::HolonEntry>, Status> {
    let located =
        identity::find_all_with_paths(root).map_err(|err| Status::internal(err.to_string()))?;
    Ok(located
        .into_iter()
        .map(|l| pb::HolonEntry {
            relative_path: relative_holon_dir(root, &l.path),
            identity: Some(to_proto(&l.identity)),
            origin: "local".to_string(),
        })
        .collect())
}

/// Probes PATH for the known holon binaries.
#[must_use]
pub fn discover_in_path() -> Vec<String> {
    KNOWN_PATH_BINARIES
        .iter()
        .filter_map(|name| {
            which::which(name)
                .ok()
                .map(|p| format!("{name} → {}", p.display()))
        })
        .collect()
}

#[tonic::async_trait]
impl OpService for OpServer {
    async fn discover(
        &self,
        request: Request<pb::DiscoverRequest>,
    ) -> Result<Response<pb::DiscoverResponse>, Status> {
        let req = request.into_inner();
        let root = if req.root_dir.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(req.root_dir)
        };

        Ok(Response::new(pb::DiscoverResponse {
            entries: entries_under(&root)?,
            path_binaries: discover_in_path(),
        }))
    }

    async fn invoke(
        &self,
        request: Request<pb::InvokeRequest>,
    ) -> Result<Response<pb::InvokeResponse>, Status> {
        let req = request.into_inner();
        let Ok(binary) = resolver::resolve(&req.holon) else {
            return Ok(Response::new(pb::InvokeResponse {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("holon {:?} not found", req.holon),
            }));
        };

        let output = tokio::process::Command::new(&binary)
            .args(&req.args)
            .output()
            .await
            .map_err(|err| Status::internal(format!("failed to run {}: {err}", req.holon)))?;

        Ok(Response::new(pb::InvokeResponse {
            exit_code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }))
    }

    async fn create_identity(
        &self,
        request: Request<pb::CreateIdentityRequest>,
    ) -> Result<Response<pb::CreateIdentityResponse>, Status> {
        let req = request.into_inner();
        if req.given_name.is_empty()
            || req.family_name.is_empty()
            || req.motto.is_empty()
            || req.composer.is_empty()
        {
            return Err(Status::invalid_argument(
                "given_name, family_name, motto, and composer are required",
            ));
        }

        let mut id = Identity::new();
        id.given_name = req.given_name;
        id.family_name = req.family_name;
        id.motto = req.motto;
        id.composer = req.composer;
        if !req.clade.is_empty() {
            id.clade = req.clade;
        }
        if !req.lang.is_empty() {
            id.lang = req.lang;
        }
        if !req.aliases.is_empty() {
            id.aliases = req.aliases;
        }
        if !req.wrapped_license.is_empty() {
            id.wrapped_license = req.wrapped_license;
        }
        if !req.reproduction.is_empty() {
            id.reproduction = req.reproduction;
        }

        let output_dir = if req.output_dir.is_empty() {
            Path::new(".holon").join(id.slug())
        } else {
            PathBuf::from(req.output_dir)
        };
        std::fs::create_dir_all(&output_dir)
            .map_err(|err| Status::internal(format!("cannot create directory: {err}")))?;

        let output_path = output_dir.join(identity::MANIFEST_NAME);
        identity::write_holon_md(&id, &output_path)
            .map_err(|err| Status::internal(err.to_string()))?;

        Ok(Response::new(pb::CreateIdentityResponse {
            identity: Some(to_proto(&id)),
            file_path: output_path.display().to_string(),
        }))
    }

    async fn list_identities(
        &self,
        request: Request<pb::ListIdentitiesRequest>,
    ) -> Result<Response<pb::ListIdentitiesResponse>, Status> {
        let req = request.into_inner();
        let root = if req.root_dir.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(req.root_dir)
        };

        Ok(Response::new(pb::ListIdentitiesResponse {
            entries: entries_under(&root)?,
        }))
    }

    async fn show_identity(
        &self,
        request: Request<pb::ShowIdentityRequest>,
    ) -> Result<Response<pb::ShowIdentityResponse>, Status> {
        let req = request.into_inner();
        let path = identity::find_by_uuid(Path::new("."), &req.uuid)
            .map_err(|err| Status::not_found(err.to_string()))?;

        let data = std::fs::read_to_string(&path)
            .map_err(|err| Status::internal(format!("cannot read {}: {err}", path.display())))?;
        let (id, _) =
            identity::parse_frontmatter(&data).map_err(|err| Status::internal(err.to_string()))?;

        Ok(Response::new(pb::ShowIdentityResponse {
            identity: Some(to_proto(&id)),
            file_path: path.display().to_string(),
            raw_content: data,
        }))
    }

    async fn pin_version(
        &self,
        request: Request<pb::PinVersionRequest>,
    ) -> Result<Response<pb::PinVersionResponse>, Status> {
        let req = request.into_inner();
        let path = identity::find_by_uuid(Path::new("."), &req.uuid)
            .map_err(|err| Status::not_found(err.to_string()))?;

        let mut id = identity::read_manifest(&path)
            .map_err(|err| Status::internal(err.to_string()))?;

        if !req.binary_path.is_empty() {
            id.binary_path = req.binary_path;
        }
        if !req.binary_version.is_empty() {
            id.binary_version = req.binary_version;
        }
        if !req.git_tag.is_empty() {
            id.git_tag = req.git_tag;
        }
        if !req.git_commit.is_empty() {
            id.git_commit = req.git_commit;
        }
        if !req.os.is_empty() {
            id.os = req.os;
        }
        if !req.arch.is_empty() {
            id.arch = req.arch;
        }

        identity::write_holon_md(&id, &path).map_err(|err| Status::internal(err.to_string()))?;

        Ok(Response::new(pb::PinVersionResponse {
            identity: Some(to_proto(&id)),
        }))
    }
}

/// Starts the gRPC server on the given transport URI.
///
/// Supported URIs: `tcp://<host>:<port>`, `unix://<path>`, `stdio://`,
/// `ws://<host>:<port>[/<path>]`. With `reflect` the v1alpha and v1
/// reflection services are registered alongside the op service.
///
/// # Errors
///
/// Fails when the listener cannot be bound, the reflection registry
/// cannot be built, or the serve loop errors out.
pub async fn listen_and_serve(listen_uri: &str, reflect: bool) -> Result<(), ServeError> {
    let listener = transport::listen(listen_uri).await?;
    tracing::info!(
        uri = %listen_uri,
        bound = %listener.description(),
        reflection = reflect,
        "op gRPC server listening"
    );

    let service = OpServer.into_service();
    let incoming = listener.into_incoming();

    if reflect {
        let v1alpha = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
            .build_v1alpha()?;
        let v1 = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
            .build_v1()?;
        tonic::transport::Server::builder()
            .add_service(service)
            .add_service(v1alpha)
            .add_service(v1)
            .serve_with_incoming(incoming)
            .await?;
    } else {
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(incoming)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{write_holon_md, MANIFEST_NAME};
    use crate::testutil::DirGuard;

    fn seed(root: &Path, name: &str, lang: &str) -> Identity {
        let dir = root.join("holons").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let id = Identity {
            uuid: format!("server-test-{name}"),
            given_name: name.to_string(),
            family_name: "Holon".to_string(),
            motto: "Testing.".to_string(),
            composer: "test".to_string(),
            clade: "deterministic/pure".to_string(),
            status: "draft".to_string(),
            born: "2026-01-01".to_string(),
            lang: lang.to_string(),
            ..Identity::default()
        };
        write_holon_md(&id, &dir.join(MANIFEST_NAME)).unwrap();
        id
    }

    #[tokio::test]
    async fn list_identities_scans_the_tree() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path(), "who", "go");
        seed(tmp.path(), "atlas", "rust");
        let _guard = DirGuard::enter(tmp.path());

        let resp = OpServer
            .list_identities(Request::new(pb::ListIdentitiesRequest {
                root_dir: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(resp.entries.len(), 2);
        let names: Vec<_> = resp
            .entries
            .iter()
            .map(|e| e.identity.as_ref().unwrap().given_name.clone())
            .collect();
        assert!(names.contains(&"who".to_string()));
        assert!(names.contains(&"atlas".to_string()));
    }

    #[tokio::test]
    async fn show_identity_by_uuid() {
        let tmp = tempfile::tempdir().unwrap();
        let id = seed(tmp.path(), "who", "go");
        let _guard = DirGuard::enter(tmp.path());

        let resp = OpServer
            .show_identity(Request::new(pb::ShowIdentityRequest {
                uuid: id.uuid.clone(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(resp.identity.unwrap().uuid, id.uuid);
        assert!(resp.file_path.ends_with("HOLON.md"));
        assert!(resp.raw_content.starts_with("---\n"));
    }

    #[tokio::test]
    async fn show_unknown_uuid_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = DirGuard::enter(tmp.path());

        let status = OpServer
            .show_identity(Request::new(pb::ShowIdentityRequest {
                uuid: "nope".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn create_identity_requires_core_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = DirGuard::enter(tmp.path());

        let status = OpServer
            .create_identity(Request::new(pb::CreateIdentityRequest {
                given_name: "solo".to_string(),
                ..pb::CreateIdentityRequest::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_then_pin_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = DirGuard::enter(tmp.path());

        let created = OpServer
            .create_identity(Request::new(pb::CreateIdentityRequest {
                given_name: "echo".to_string(),
                family_name: "Holon".to_string(),
                motto: "Repeats.".to_string(),
                composer: "test".to_string(),
                lang: "rust".to_string(),
                ..pb::CreateIdentityRequest::default()
            }))
            .await
            .unwrap()
            .into_inner();
        let uuid = created.identity.unwrap().uuid;

        let pinned = OpServer
            .pin_version(Request::new(pb::PinVersionRequest {
                uuid: uuid.clone(),
                binary_version: "1.2.3".to_string(),
                git_commit: "abc123".to_string(),
                ..pb::PinVersionRequest::default()
            }))
            .await
            .unwrap()
            .into_inner();

        let id = pinned.identity.unwrap();
        assert_eq!(id.uuid, uuid);
        assert_eq!(id.binary_version, "1.2.3");
        assert_eq!(id.git_commit, "abc123");
    }

    #[tokio::test]
    async fn invoke_unknown_holon_reports_exit_one() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = DirGuard::enter(tmp.path());

        let resp = OpServer
            .invoke(Request::new(pb::InvokeRequest {
                holon: "nonexistent-holon-xyz".to_string(),
                args: vec![],
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.exit_code, 1);
        assert!(resp.stderr.contains("not found"));
    }
}
