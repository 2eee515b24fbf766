//! `op serve`: the dispatcher's own gRPC facet.

use clap::Parser;
use op_core::server;

#[derive(Parser, Debug)]
#[command(name = "serve")]
struct ServeArgs {
    /// Listen URI (tcp://, unix://, stdio://, ws://).
    #[arg(long)]
    listen: Option<String>,

    /// Legacy TCP shorthand: port to listen on.
    #[arg(long, default_value = "9090")]
    port: String,

    /// Disable the reflection service.
    #[arg(long)]
    no_reflect: bool,
}

/// Handles `op serve …`. Blocks until the server exits.
pub async fn cmd_serve(args: &[String]) -> i32 {
    let parsed = ServeArgs::try_parse_from(
        std::iter::once("serve".to_string()).chain(args.iter().cloned()),
    );
    let parsed = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("op serve: {err}");
            return 1;
        }
    };

    let listen_uri = parsed
        .listen
        .unwrap_or_else(|| format!("tcp://:{}", parsed.port));

    match server::listen_and_serve(&listen_uri, !parsed.no_reflect).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("op serve: {err}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bad_listen_uri_fails() {
        let code = cmd_serve(&["--listen".to_string(), "carrier-pigeon://x".to_string()]).await;
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn wss_listen_is_rejected() {
        let code = cmd_serve(&["--listen".to_string(), "wss://127.0.0.1:0".to_string()]).await;
        assert_eq!(code, 1);
    }
}
