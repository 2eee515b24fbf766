//! Holon dispatch: verb→RPC mapping and opaque subprocess passthrough.
//!
//! `op <holon> <verb> [args]` maps the four promoted verbs onto the
//! identity service's methods and routes the call through the transport
//! chain. Any other first token is an opaque subprocess dispatch: the
//! holon binary runs with inherited stdio and its exit code passes
//! through verbatim.

use anyhow::Context;
use op_core::process::LaunchConfig;
use op_core::{resolver, selector};

use crate::client::{self, stdio::call_via_stdio};
use crate::compose;
use crate::format::{format_rpc_output, Format};

/// Verbs with a fixed method mapping. Everything else is a subprocess
/// command, not an RPC.
const MAPPED_VERBS: &[&str] = &["new", "list", "show", "pin"];

/// Translates verb-form arguments into `(method, input_json)`.
///
/// The table is a closed set with a JSON fallback: an unmapped token
/// passes through verbatim as the method name, taking a JSON argument
/// when one follows.
///
/// # Errors
///
/// `show` and `pin` without a UUID are usage errors; they never reach a
/// transport.
pub fn map_holon_command_to_rpc(args: &[String]) -> Result<(String, String), String> {
    let Some(verb) = args.first() else {
        return Err("command required".to_string());
    };
    let rest = &args[1..];

    match verb.as_str() {
        "new" => Ok(("CreateIdentity".to_string(), json_arg_or_empty(rest))),
        "list" => match rest.first() {
            Some(arg) if !looks_like_json(arg) => Ok((
                "ListIdentities".to_string(),
                serde_json::json!({ "rootDir": arg }).to_string(),
            )),
            _ => Ok(("ListIdentities".to_string(), "{}".to_string())),
        },
        "show" => {
            let uuid = rest.first().ok_or_else(|| "show: UUID required".to_string())?;
            Ok((
                "ShowIdentity".to_string(),
                serde_json::json!({ "uuid": uuid }).to_string(),
            ))
        }
        "pin" => {
            let uuid = rest.first().ok_or_else(|| "pin: UUID required".to_string())?;
            Ok((
                "PinVersion".to_string(),
                serde_json::json!({ "uuid": uuid }).to_string(),
            ))
        }
        other => Ok((other.to_string(), json_arg_or_empty(rest))),
    }
}

fn looks_like_json(arg: &str) -> bool {
    let trimmed = arg.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

fn json_arg_or_empty(rest: &[String]) -> String {
    match rest.first() {
        Some(arg) if looks_like_json(arg) => arg.clone(),
        _ => "{}".to_string(),
    }
}

/// Dispatches `op <holon> <args…>`.
pub async fn cmd_dispatch(format: Format, holon: &str, args: &[String]) -> i32 {
    let is_verb = args
        .first()
        .is_some_and(|first| MAPPED_VERBS.contains(&first.as_str()));

    if is_verb {
        rpc_dispatch(format, holon, args).await
    } else {
        opaque_dispatch(holon, args).await
    }
}

// The CLI facet: run the binary as-is and forward everything.
async fn opaque_dispatch(holon: &str, args: &[String]) -> i32 {
    let Ok(binary) = resolver::resolve(holon) else {
        eprintln!("op: unknown holon {holon:?}");
        eprintln!("Run 'op discover' to see available holons.");
        return 1;
    };

    match tokio::process::Command::new(&binary).args(args).status().await {
        Ok(status) => status.code().unwrap_or(1),
        Err(err) => {
            eprintln!("op: {err}");
            1
        }
    }
}

async fn rpc_dispatch(format: Format, holon: &str, args: &[String]) -> i32 {
    let (method, input) = match map_holon_command_to_rpc(args) {
        Ok(mapped) => mapped,
        Err(err) => {
            eprintln!("op {err}");
            return 1;
        }
    };

    match rpc_dispatch_via_chain(format, holon, &method, &input).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
            0
        }
        Err(err) => {
            eprintln!("op grpc: {err:#}");
            1
        }
    }
}

/// Routes one mapped RPC through the selected transport. `mem` falls
/// through to stdio when the dispatcher has no in-process adapter for
/// the holon.
pub async fn rpc_dispatch_via_chain(
    format: Format,
    holon: &str,
    method: &str,
    input: &str,
) -> anyhow::Result<String> {
    let scheme = selector::select_transport(holon)?;

    match scheme.as_str() {
        "mem" if compose::is_composable(holon) => {
            let output = compose::call_via_mem(holon, method, input).await?;
            Ok(format_rpc_output(format, method, &output))
        }
        "mem" | "stdio" => dispatch_via_stdio(format, holon, method, input).await,
        _ => dispatch_via_ephemeral_tcp(format, holon, method, input).await,
    }
}

async fn dispatch_via_stdio(
    format: Format,
    holon: &str,
    method: &str,
    input: &str,
) -> anyhow::Result<String> {
    let binary =
        resolver::resolve(holon).with_context(|| format!("holon {holon:?} not found"))?;
    let result = call_via_stdio(&binary, method, input, &LaunchConfig::default()).await?;
    Ok(format_rpc_output(format, method, &result.output))
}

async fn dispatch_via_ephemeral_tcp(
    format: Format,
    holon: &str,
    method: &str,
    input: &str,
) -> anyhow::Result<String> {
    let binary =
        resolver::resolve(holon).with_context(|| format!("holon {holon:?} not found"))?;

    let cfg = LaunchConfig::default();
    let launch = op_core::process::launch_tcp(&binary, &cfg).await?;

    let call = tokio::time::timeout(client::INVOKE_DEADLINE, async {
        let channel = client::dial_tcp(&launch.address).await?;
        client::call(channel, method, input).await
    })
    .await;

    let cleanup = op_core::process::terminate(launch.child, cfg.term_grace).await;

    let result = match call {
        Ok(result) => result?,
        Err(_) => anyhow::bail!(
            "call timed out after {}s",
            client::INVOKE_DEADLINE.as_secs()
        ),
    };
    cleanup?;

    Ok(format_rpc_output(format, method, &result.output))
}
