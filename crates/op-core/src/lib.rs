//! Core library for `op`, the holon dispatcher.
//!
//! A holon is an independently built program that speaks the common
//! service contract: it accepts `serve --listen <URI>` and exposes a gRPC
//! server (with reflection) on the requested transport. This crate holds
//! everything the dispatcher needs below the command layer:
//!
//! - [`transport`] - URI-based listener construction and the connection
//!   types for tcp, unix, stdio, mem, and WebSocket transports
//! - [`resolver`] - mapping a short holon name to a binary and a declared
//!   implementation language
//! - [`config`] - per-invocation transport overrides from `.holonconfig`
//! - [`selector`] - the transport-selection chain (override → mem → stdio)
//! - [`process`] - subprocess lifecycle: ephemeral launches, readiness
//!   detection, and SIGTERM-then-kill teardown
//! - [`identity`] - HOLON.md front-matter manifests
//! - [`server`] - the dispatcher's own `op.v1.OpService` implementation
//! - [`proto`] - generated protobuf types and the encoded descriptor set

pub mod config;
pub mod identity;
pub mod process;
pub mod proto;
pub mod resolver;
pub mod selector;
pub mod server;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;
