//! Server-reflection descriptor resolution.
//!
//! Fetches file descriptors over the gRPC reflection protocol (v1alpha)
//! and stitches the transitive import closure into a descriptor pool.
//! Requests on the reflection stream are strictly sequential: the
//! protocol is request/response on one bidirectional stream, so the
//! dependency walk must not interleave.
//!
//! Two server quirks are handled:
//!
//! 1. Some servers register descriptors under a path-prefixed name. A
//!    failed lookup of `dep` is retried as `protos/<dep>`.
//! 2. A lookup may return a file whose own `name` differs from the
//!    requested one but ends with it (requested `foo.proto`, received
//!    `protos/foo.proto`). The received file is kept under its own name
//!    and a clone renamed to the requested name is added, so the
//!    importing edge resolves whichever prefix an importer uses.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use prost::Message;
use prost_reflect::{DescriptorPool, ServiceDescriptor};
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::Streaming;
use tonic_reflection::pb::v1alpha::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1alpha::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1alpha::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1alpha::{ServerReflectionRequest, ServerReflectionResponse};

use super::ClientError;

/// The registered prefix some servers use for descriptor file names.
const ALIAS_PREFIX: &str = "protos/";

/// Reflection service names to skip when enumerating callable services.
pub const REFLECTION_SERVICES: &[&str] = &[
    "grpc.reflection.v1alpha.ServerReflection",
    "grpc.reflection.v1.ServerReflection",
];

/// Returns true for the reflection service's own entries.
#[must_use]
pub fn is_reflection_service(name: &str) -> bool {
    REFLECTION_SERVICES.contains(&name)
}

/// Anything that can answer descriptor queries. The live implementation
/// is [`ReflectionStream`]; tests use an in-memory fixture.
#[async_trait]
pub trait DescriptorSource {
    /// Returns the file containing `symbol` plus whatever transitive
    /// context the server chooses to include.
    async fn file_containing_symbol(
        &mut self,
        symbol: &str,
    ) -> Result<Vec<FileDescriptorProto>, ClientError>;

    /// Returns the file registered under `filename`.
    async fn file_by_filename(
        &mut self,
        filename: &str,
    ) -> Result<Vec<FileDescriptorProto>, ClientError>;
}

/// A live reflection session over a single bidirectional stream.
pub struct ReflectionStream {
    tx: mpsc::Sender<ServerReflectionRequest>,
    inbound: Streaming<ServerReflectionResponse>,
}

impl ReflectionStream {
    /// Opens the reflection stream on `channel`.
    ///
    /// # Errors
    ///
    /// Fails when the server does not expose the reflection service.
    pub async fn open(channel: Channel) -> Result<Self, ClientError> {
        let mut client = ServerReflectionClient::new(channel);
        let (tx, rx) = mpsc::channel(8);
        let response = client
            .server_reflection_info(ReceiverStream::new(rx))
            .await
            .map_err(ClientError::ReflectionUnavailable)?;
        Ok(Self {
            tx,
            inbound: response.into_inner(),
        })
    }

    async fn roundtrip(
        &mut self,
        request: MessageRequest,
    ) -> Result<MessageResponse, ClientError> {
        self.tx
            .send(ServerReflectionRequest {
                host: String::new(),
                message_request: Some(request),
            })
            .await
            .map_err(|_| ClientError::StreamClosed)?;

        let response = self
            .inbound
            .message()
            .await
            .map_err(ClientError::Stream)?
            .ok_or(ClientError::StreamClosed)?;
        response.message_response.ok_or(ClientError::StreamClosed)
    }

    /// Lists the service names the server exposes.
    ///
    /// # Errors
    ///
    /// Fails on stream errors or an unexpected response shape.
    pub async fn list_services(&mut self) -> Result<Vec<String>, ClientError> {
        match self.roundtrip(MessageRequest::ListServices(String::new())).await? {
            MessageResponse::ListServicesResponse(list) => {
                Ok(list.service.into_iter().map(|s| s.name).collect())
            }
            MessageResponse::ErrorResponse(err) => Err(ClientError::ReflectionError {
                message: err.error_message,
            }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    async fn fetch_files(
        &mut self,
        request: MessageRequest,
        what: &str,
    ) -> Result<Vec<FileDescriptorProto>, ClientError> {
        match self.roundtrip(request).await? {
            MessageResponse::FileDescriptorResponse(resp) => resp
                .file_descriptor_proto
                .iter()
                .map(|bytes| {
                    FileDescriptorProto::decode(bytes.as_slice())
                        .map_err(|source| ClientError::DecodeDescriptor {
                            what: what.to_string(),
                            source,
                        })
                })
                .collect(),
            MessageResponse::ErrorResponse(err) => Err(ClientError::ReflectionError {
                message: err.error_message,
            }),
            _ => Err(ClientError::NoFileDescriptor {
                symbol: what.to_string(),
            }),
        }
    }
}

#[async_trait]
impl DescriptorSource for ReflectionStream {
    async fn file_containing_symbol(
        &mut self,
        symbol: &str,
    ) -> Result<Vec<FileDescriptorProto>, ClientError> {
        self.fetch_files(
            MessageRequest::FileContainingSymbol(symbol.to_string()),
            symbol,
        )
        .await
    }

    async fn file_by_filename(
        &mut self,
        filename: &str,
    ) -> Result<Vec<FileDescriptorProto>, ClientError> {
        self.fetch_files(
            MessageRequest::FileByFilename(filename.to_string()),
            filename,
        )
        .await
    }
}

/// The stitched descriptor closure for one symbol.
///
/// `files` holds every file the walk registered, in traversal order,
/// including both halves of any alias pair.
pub struct ResolvedDescriptors {
    files: Vec<FileDescriptorProto>,
    alias_sources: HashSet<String>,
}

impl ResolvedDescriptors {
    /// All registered files in traversal order.
    #[must_use]
    pub fn files(&self) -> &[FileDescriptorProto] {
        &self.files
    }

    /// Compiles the closure into a descriptor pool.
    ///
    /// Alias-source files that no import edge references are left out of
    /// the compiled set: their renamed clones carry the same symbols, and
    /// a pool rejects the same symbol defined twice.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor set does not form a valid schema.
    pub fn compile(&self) -> Result<DescriptorPool, ClientError> {
        let referenced: HashSet<&str> = self
            .files
            .iter()
            .flat_map(|f| f.dependency.iter().map(String::as_str))
            .collect();

        let included: Vec<FileDescriptorProto> = self
            .files
            .iter()
            .filter(|f| {
                let name = f.name();
                !self.alias_sources.contains(name) || referenced.contains(name)
            })
            .cloned()
            .collect();

        let set = FileDescriptorSet {
            file: topo_order(included),
        };
        DescriptorPool::from_file_descriptor_set(set).map_err(ClientError::BuildDescriptors)
    }
}

// Dependencies before dependents; unknown imports are ignored (the pool
// reports them properly).
fn topo_order(files: Vec<FileDescriptorProto>) -> Vec<FileDescriptorProto> {
    let index: HashMap<String, usize> = files
        .iter()
        .enumerate()
        .map(|(i, f)| (f.name().to_string(), i))
        .collect();

    let mut ordered = Vec::with_capacity(files.len());
    let mut visited = vec![false; files.len()];
    let mut stack: VecDeque<usize> = (0..files.len()).collect();

    fn visit(
        i: usize,
        files: &[FileDescriptorProto],
        index: &HashMap<String, usize>,
        visited: &mut [bool],
        ordered: &mut Vec<FileDescriptorProto>,
    ) {
        if visited[i] {
            return;
        }
        visited[i] = true;
        for dep in &files[i].dependency {
            if let Some(&j) = index.get(dep.as_str()) {
                visit(j, files, index, visited, ordered);
            }
        }
        ordered.push(files[i].clone());
    }

    while let Some(i) = stack.pop_front() {
        visit(i, &files, &index, &mut visited, &mut ordered);
    }
    ordered
}

/// Fetches and stitches the descriptor closure for `symbol`.
///
/// # Errors
///
/// Propagates fetch and decode failures; an import that cannot be
/// resolved under either its own name or the `protos/` prefix is fatal.
pub async fn resolve_descriptors<S: DescriptorSource + Send>(
    source: &mut S,
    symbol: &str,
) -> Result<ResolvedDescriptors, ClientError> {
    let seed = source.file_containing_symbol(symbol).await?;
    if seed.is_empty() {
        return Err(ClientError::NoFileDescriptor {
            symbol: symbol.to_string(),
        });
    }

    let mut files: HashMap<String, FileDescriptorProto> = HashMap::new();
    let mut queue: Vec<String> = Vec::new();
    let mut alias_sources: HashSet<String> = HashSet::new();

    for fd in seed {
        let name = fd.name().to_string();
        if name.is_empty() || files.contains_key(&name) {
            continue;
        }
        files.insert(name.clone(), fd);
        queue.push(name);
    }

    // The initial response need not include transitive imports; fetch
    // missing dependencies until the closure is complete. Single-task BFS:
    // replies on the stream arrive in request order.
    let mut i = 0;
    while i < queue.len() {
        let deps: Vec<String> = files[&queue[i]].dependency.clone();
        i += 1;

        for dep in deps {
            if files.contains_key(&dep) {
                continue;
            }

            let dep_files = match source.file_by_filename(&dep).await {
                Ok(found) => found,
                Err(first_err) => {
                    if dep.starts_with(ALIAS_PREFIX) {
                        return Err(first_err);
                    }
                    source
                        .file_by_filename(&format!("{ALIAS_PREFIX}{dep}"))
                        .await?
                }
            };

            // A file whose name merely ends with the requested dependency
            // is an alias registration.
            let alias_source = dep_files
                .iter()
                .map(|fd| fd.name())
                .find(|name| !name.is_empty() && *name != dep && name.ends_with(&dep))
                .map(str::to_string);
            if let Some(src_name) = &alias_source {
                alias_sources.insert(src_name.clone());
            }

            let mut resolved_dep_name = false;
            for fd in &dep_files {
                let name = fd.name().to_string();
                if name.is_empty() {
                    continue;
                }
                if name == dep {
                    resolved_dep_name = true;
                }
                if files.contains_key(&name) {
                    continue;
                }
                files.insert(name.clone(), fd.clone());
                queue.push(name);
            }

            if !resolved_dep_name {
                if let Some(src_name) = alias_source {
                    if let Some(src) = files.get(&src_name) {
                        let mut clone = src.clone();
                        clone.name = Some(dep.clone());
                        files.insert(dep.clone(), clone);
                        queue.push(dep.clone());
                    }
                }
            }
        }
    }

    Ok(ResolvedDescriptors {
        files: queue
            .iter()
            .map(|name| files[name].clone())
            .collect(),
        alias_sources,
    })
}

/// Resolves `service_name` to a compiled service descriptor.
///
/// # Errors
///
/// Fails when the descriptors cannot be fetched or compiled, or when the
/// compiled pool has no such service.
pub async fn resolve_service<S: DescriptorSource + Send>(
    source: &mut S,
    service_name: &str,
) -> Result<ServiceDescriptor, ClientError> {
    let resolved = resolve_descriptors(source, service_name).await?;
    let pool = resolved.compile()?;
    pool.get_service_by_name(service_name)
        .ok_or_else(|| ClientError::ServiceNotFound {
            name: service_name.to_string(),
        })
}
