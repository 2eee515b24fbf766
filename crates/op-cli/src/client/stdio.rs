//! Ephemeral gRPC over a child's stdin/stdout.
//!
//! The purest form of inter-holon gRPC: zero networking, zero port
//! allocation. The dispatcher launches `<binary> serve --listen stdio://`,
//! adopts the pipe as a single-use connection, makes exactly one call,
//! and tears the child down.

use std::path::Path;

use op_core::process::{self, LaunchConfig};

use super::{call, dial_single_use, CallResult, ClientError, INVOKE_DEADLINE};

/// Launches the holon binary, calls `method` over the adopted pipe, and
/// guarantees SIGTERM-then-kill cleanup.
///
/// The dial and the call share the invocation deadline; teardown runs
/// regardless of how the call ended.
///
/// # Errors
///
/// Fails on launch/readiness problems, call failures, the deadline, or
/// a child that does not exit within the grace period. A call error
/// takes precedence over a cleanup error.
pub async fn call_via_stdio(
    binary: &Path,
    method: &str,
    input_json: &str,
    cfg: &LaunchConfig,
) -> Result<CallResult, ClientError> {
    let launch = process::launch_stdio(binary, cfg).await?;

    let result = tokio::time::timeout(INVOKE_DEADLINE, async {
        let channel = dial_single_use(launch.conn, "stdio pipe").await?;
        call(channel, method, input_json).await
    })
    .await
    .unwrap_or(Err(ClientError::Timeout {
        secs: INVOKE_DEADLINE.as_secs(),
    }));

    let cleanup = process::terminate(launch.child, cfg.term_grace).await;

    let result = result?;
    cleanup?;
    Ok(result)
}
