//! Command routing for the dispatcher.
//!
//! The surface is open-ended: after the global format flag, the first
//! token is either one of op's own commands, a `grpc…://` URI, or a
//! holon name. Flags after the first positional are never global; they
//! belong to whatever is being dispatched.

mod discover;
mod dispatch;
mod grpc;
mod launch;
mod serve;

use crate::format::Format;

pub use dispatch::map_holon_command_to_rpc;

/// Dispatches the command line and returns an exit code.
pub async fn run(args: &[String], version: &str) -> i32 {
    let (format, rest) = match parse_global_format(args) {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("op: {err}");
            return 1;
        }
    };

    let Some(command) = rest.first() else {
        print_usage();
        return 0;
    };
    let tail = &rest[1..];

    match command.as_str() {
        "run" => launch::cmd_run(tail),
        "discover" => discover::cmd_discover(format),
        "serve" => serve::cmd_serve(tail).await,
        "version" => {
            println!("op {version}");
            0
        }
        "help" | "--help" | "-h" => {
            print_usage();
            0
        }
        _ if grpc::is_grpc_uri(command) => grpc::cmd_grpc(format, command, tail).await,
        _ => dispatch::cmd_dispatch(format, command, tail).await,
    }
}

/// Strips the leading `-f|--format` occurrences (space or `=` forms) and
/// returns the chosen format plus the untouched remainder.
///
/// # Errors
///
/// Returns a message for a missing or invalid format value.
pub fn parse_global_format(args: &[String]) -> Result<(Format, Vec<String>), String> {
    let mut format = Format::default();
    let mut i = 0;

    while i < args.len() {
        let arg = &args[i];
        if arg == "-f" || arg == "--format" {
            let value = args
                .get(i + 1)
                .ok_or_else(|| format!("missing value for {arg}"))?;
            format = value.parse()?;
            i += 2;
        } else if let Some(value) = arg
            .strip_prefix("--format=")
            .or_else(|| arg.strip_prefix("-f="))
        {
            format = value.parse()?;
            i += 1;
        } else {
            break;
        }
    }

    Ok((format, args[i..].to_vec()))
}

/// Displays the help text.
pub fn print_usage() {
    print!(
        "op — the Organic Programming CLI

Holon dispatch:
  op <holon> <verb> [args]               verb dispatch (new/list/show/pin)
  op <holon> <command> [args]            CLI facet (subprocess)
  op grpc://<host:port> [method [json]]  gRPC over TCP (existing server)
  op grpc://<holon> <method> [json]      ephemeral dispatch (mem/stdio/TCP)
  op grpc+stdio://<holon> <method>       gRPC over stdio pipe (ephemeral)
  op grpc+unix://<path> [method [json]]  gRPC over Unix socket
  op grpc+ws://<host:port> <method>      gRPC over WebSocket
  op grpc+wss://<host:port> <method>     gRPC over TLS WebSocket
  op run <holon>:<port>                  start a holon's gRPC server (TCP)
  op run <holon> --listen <URI>          start with any transport

OP commands:
  op discover                            list available holons
  op serve [--listen tcp://:9090]        start OP's own gRPC server
  op version                             show op version
  op help                                this message

Global flags (before the first positional):
  -f, --format text|json                 output format (default text)
"
    );
}
