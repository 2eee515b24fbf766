//! `op run`: persistent holon servers.
//!
//! Starts a holon's gRPC server as a detached background process and
//! prints the pid. Two forms: `<holon>:<port>` (TCP shorthand) and
//! `<holon> --listen <URI>`.

use clap::Parser;
use op_core::{process, resolver};

#[derive(Parser, Debug)]
#[command(name = "run", disable_help_flag = true)]
struct RunArgs {
    /// `<holon>:<port>` or a bare holon name with `--listen`.
    target: String,

    /// Listen URI for the spawned server.
    #[arg(long)]
    listen: Option<String>,
}

/// Handles `op run …`.
pub fn cmd_run(args: &[String]) -> i32 {
    let parsed = RunArgs::try_parse_from(
        std::iter::once("run".to_string()).chain(args.iter().cloned()),
    );
    let parsed = match parsed {
        Ok(parsed) => parsed,
        Err(_) => {
            eprintln!("op run: requires <holon>:<port> or <holon> --listen <URI>");
            return 1;
        }
    };

    let (holon, listen_uri) = match parsed.listen {
        Some(uri) => (parsed.target, uri),
        None => {
            let Some((name, port)) = parsed.target.split_once(':').filter(|(n, p)| {
                !n.is_empty() && !p.is_empty()
            }) else {
                eprintln!("op run: format is <holon>:<port> or <holon> --listen <URI>");
                return 1;
            };
            (name.to_string(), format!("tcp://:{port}"))
        }
    };

    let Ok(binary) = resolver::resolve(&holon) else {
        eprintln!("op run: holon {holon:?} not found");
        return 1;
    };

    match process::spawn_persistent(&binary, &listen_uri) {
        Ok(pid) => {
            println!("op run: started {holon} (pid {pid}) on {listen_uri}");
            println!("op run: stop with: kill {pid}");
            0
        }
        Err(err) => {
            eprintln!("op run: {err}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn missing_target_is_usage_error() {
        assert_eq!(cmd_run(&[]), 1);
    }

    #[test]
    fn bad_target_shape_is_usage_error() {
        assert_eq!(cmd_run(&strings(&["who"])), 1);
        assert_eq!(cmd_run(&strings(&["who:"])), 1);
        assert_eq!(cmd_run(&strings(&[":9090"])), 1);
    }

    #[test]
    fn unknown_holon_fails() {
        assert_eq!(cmd_run(&strings(&["nonexistent-holon-zz:9090"])), 1);
    }
}
