//! op: the unified holon dispatcher.
//!
//! One command in front of every holon: verb dispatch, URI dispatch,
//! ephemeral servers, discovery, and op's own gRPC facet.

use std::process::ExitCode;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod client;
mod commands;
mod compose;
mod format;
mod proto_json;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        commands::print_usage();
        return ExitCode::SUCCESS;
    }

    let code = commands::run(&args, VERSION).await;
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
