//! URI-form gRPC dispatch.
//!
//! Routes on the URI prefix:
//!
//! - `grpc://host:port [method [json]]` - TCP to an existing server;
//!   with no method, list what reflection exposes
//! - `grpc://<name> <method> [json]` - ephemeral: honour the selector's
//!   mem/stdio suggestion, else start the binary on a random port
//! - `grpc+stdio://<name>` - forced stdio pipe
//! - `grpc+unix://<path>` - Unix-domain socket
//! - `grpc+ws://…` / `grpc+wss://…` - WebSocket upgrade (default path
//!   `/grpc`)

use anyhow::Context;
use op_core::process::LaunchConfig;
use op_core::{resolver, selector};

use crate::client::{self, stdio::call_via_stdio, ws::call_via_websocket};
use crate::compose;
use crate::format::{format_rpc_output, Format};

/// Returns true when the token is one of the dispatchable gRPC URI
/// prefixes.
#[must_use]
pub fn is_grpc_uri(command: &str) -> bool {
    ["grpc://", "grpc+stdio://", "grpc+unix://", "grpc+ws://", "grpc+wss://"]
        .iter()
        .any(|prefix| command.starts_with(prefix))
}

/// Dispatches a `grpc…://` invocation.
pub async fn cmd_grpc(format: Format, uri: &str, args: &[String]) -> i32 {
    let result = route(format, uri, args).await;
    match result {
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

async fn route(format: Format, uri: &str, args: &[String]) -> anyhow::Result<String> {
    if let Some(name) = uri.strip_prefix("grpc+stdio://") {
        let (method, input) = require_method(uri, args)?;
        let binary = resolver::resolve(name).with_context(|| format!("holon {name:?} not found"))?;
        let result = call_via_stdio(&binary, method, input, &LaunchConfig::default()).await?;
        return Ok(format_rpc_output(format, method, &result.output));
    }

    if let Some(path) = uri.strip_prefix("grpc+unix://") {
        let channel = client::dial_unix(path).await?;
        return match split_method(args) {
            None => list_methods(channel, &format!("unix://{path}")).await,
            Some((method, input)) => {
                let result = call_with_deadline(channel, method, input).await?;
                Ok(format_rpc_output(format, method, &result.output))
            }
        };
    }

    if uri.starts_with("grpc+ws://") || uri.starts_with("grpc+wss://") {
        let (method, input) = require_method(uri, args)?;
        let ws_uri = websocket_uri(uri);
        let call = tokio::time::timeout(
            client::INVOKE_DEADLINE,
            call_via_websocket(&ws_uri, method, input),
        )
        .await;
        let result = match call {
            Ok(result) => result?,
            Err(_) => anyhow::bail!(
                "call timed out after {}s",
                client::INVOKE_DEADLINE.as_secs()
            ),
        };
        return Ok(format_rpc_output(format, method, &result.output));
    }

    let target = uri.strip_prefix("grpc://").unwrap_or(uri);
    if let Some(address) = as_host_port(target) {
        let channel = client::dial_tcp(&address).await?;
        return match split_method(args) {
            None => list_methods(channel, &address).await,
            Some((method, input)) => {
                let result = call_with_deadline(channel, method, input).await?;
                Ok(format_rpc_output(format, method, &result.output))
            }
        };
    }

    // Ephemeral mode: the target is a holon name.
    ephemeral_dispatch(format, target, uri, args).await
}

async fn ephemeral_dispatch(
    format: Format,
    name: &str,
    uri: &str,
    args: &[String],
) -> anyhow::Result<String> {
    let Some((method, input)) = split_method(args) else {
        anyhow::bail!("method required for ephemeral mode\nusage: op grpc://{name} <method>");
    };

    // An override (or the language heuristic) may route around TCP
    // entirely.
    match selector::select_transport(name) {
        Ok(scheme) if scheme == "mem" && compose::is_composable(name) => {
            let output = compose::call_via_mem(name, method, input).await?;
            return Ok(format_rpc_output(format, method, &output));
        }
        Ok(scheme) if scheme == "mem" || scheme == "stdio" => {
            let binary =
                resolver::resolve(name).with_context(|| format!("holon {name:?} not found"))?;
            let result = call_via_stdio(&binary, method, input, &LaunchConfig::default()).await?;
            return Ok(format_rpc_output(format, method, &result.output));
        }
        Ok(_) | Err(_) => {}
    }

    let binary = resolver::resolve(name).with_context(|| format!("holon {name:?} not found"))?;
    let cfg = LaunchConfig::default();
    let launch = op_core::process::launch_tcp(&binary, &cfg)
        .await
        .with_context(|| format!("cannot start {name} for {uri}"))?;

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

async fn call_with_deadline(
    channel: tonic::transport::Channel,
    method: &str,
    input: &str,
) -> anyhow::Result<client::CallResult> {
    match tokio::time::timeout(client::INVOKE_DEADLINE, client::call(channel, method, input)).await
    {
        Ok(result) => Ok(result?),
        Err(_) => anyhow::bail!(
            "call timed out after {}s",
            client::INVOKE_DEADLINE.as_secs()
        ),
    }
}

async fn list_methods(
    channel: tonic::transport::Channel,
    address: &str,
) -> anyhow::Result<String> {
    let methods =
        match tokio::time::timeout(client::LIST_DEADLINE, client::list_methods(channel)).await {
            Ok(methods) => methods?,
            Err(_) => anyhow::bail!(
                "listing timed out after {}s",
                client::LIST_DEADLINE.as_secs()
            ),
        };

    let mut out = format!("Available methods at {address}:");
    for method in methods {
        out.push_str("\n  ");
        out.push_str(&method);
    }
    Ok(out)
}

fn require_method<'a>(uri: &str, args: &'a [String]) -> anyhow::Result<(&'a str, &'a str)> {
    split_method(args)
        .ok_or_else(|| anyhow::anyhow!("method required\nusage: op {uri} <method>"))
}

fn split_method(args: &[String]) -> Option<(&str, &str)> {
    let method = args.first()?;
    let input = args.get(1).map_or("{}", String::as_str);
    Some((method.as_str(), input))
}

// "host:port" with a numeric port is a direct address; anything else is
// treated as a holon name for ephemeral mode.
fn as_host_port(target: &str) -> Option<String> {
    let (host, port) = target.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    if host.is_empty() {
        Some(format!("localhost:{port}"))
    } else {
        Some(format!("{host}:{port}"))
    }
}

// grpc+ws://host:port → ws://host:port, appending /grpc when no path was
// given.
fn websocket_uri(uri: &str) -> String {
    let ws = uri.trim_start_matches("grpc+");
    let after_scheme = ws.find("://").map_or(ws.len(), |i| i + 3);
    if ws[after_scheme..].contains('/') {
        ws.to_string()
    } else {
        format!("{ws}/grpc")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_uri_detection() {
        assert!(is_grpc_uri("grpc://localhost:9090"));
        assert!(is_grpc_uri("grpc+stdio://who"));
        assert!(is_grpc_uri("grpc+unix:///tmp/op.sock"));
        assert!(is_grpc_uri("grpc+ws://localhost:8080"));
        assert!(is_grpc_uri("grpc+wss://example.com:443"));
        assert!(!is_grpc_uri("who"));
        assert!(!is_grpc_uri("http://localhost"));
    }

    #[test]
    fn host_port_detection() {
        assert_eq!(
            as_host_port("localhost:9090").as_deref(),
            Some("localhost:9090")
        );
        assert_eq!(as_host_port(":9090").as_deref(), Some("localhost:9090"));
        assert!(as_host_port("who").is_none());
        assert!(as_host_port("who:port").is_none());
        assert!(as_host_port("host:99999").is_none());
    }

    #[test]
    fn websocket_uri_defaults_path() {
        assert_eq!(
            websocket_uri("grpc+ws://localhost:8080"),
            "ws://localhost:8080/grpc"
        );
        assert_eq!(
            websocket_uri("grpc+ws://localhost:8080/rpc"),
            "ws://localhost:8080/rpc"
        );
        assert_eq!(
            websocket_uri("grpc+wss://example.com:443"),
            "wss://example.com:443/grpc"
        );
    }

    #[test]
    fn method_splitting() {
        assert_eq!(split_method(&[]), None);
        let args = vec!["ListIdentities".to_string()];
        assert_eq!(split_method(&args), Some(("ListIdentities", "{}")));
        let args = vec!["Show".to_string(), r#"{"uuid":"u"}"#.to_string()];
        assert_eq!(split_method(&args), Some(("Show", r#"{"uuid":"u"}"#)));
    }

    #[tokio::test]
    async fn direct_dial_to_dead_port_fails() {
        // Bind-and-drop to find a port with nothing behind it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let code = cmd_grpc(
            Format::Text,
            &format!("grpc://{addr}"),
            &["ListIdentities".to_string()],
        )
        .await;
        assert_eq!(code, 1);
    }
}
