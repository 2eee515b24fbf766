//! Subprocess lifecycle for ephemeral and persistent holon servers.
//!
//! Ephemeral dispatch owns the whole child lifetime: launch, readiness
//! detection, one call, SIGTERM-then-kill teardown. Persistent launches
//! detach and hand the pid to the operator.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};

use crate::transport::PipeConn;

/// Errors raised during subprocess management.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// The binary could not be spawned.
    #[error("start {path}: {source}")]
    SpawnFailed {
        /// The binary path.
        path: String,
        /// Underlying failure.
        source: std::io::Error,
    },

    /// No free port could be allocated for an ephemeral TCP launch.
    #[error("cannot allocate port: {0}")]
    PortAllocation(#[source] std::io::Error),

    /// The server did not accept connections within the readiness budget.
    #[error("{path} did not start within {budget_secs}s on port {port}")]
    TcpReadyTimeout {
        /// The binary path.
        path: String,
        /// The total readiness budget, in seconds.
        budget_secs: u64,
        /// The port that was polled.
        port: u16,
    },

    /// The stdio server's preface byte never arrived.
    #[error("server startup timeout")]
    StdioReadyTimeout,

    /// The stdio pipe closed before the server emitted its preface.
    #[error("server did not start: {0}")]
    PrefaceRead(#[source] std::io::Error),

    /// The child's stdio handles were not available after spawn.
    #[error("child stdio pipes unavailable")]
    PipesUnavailable,

    /// Delivering SIGTERM failed.
    #[error("send SIGTERM: {0}")]
    Signal(#[source] nix::Error),

    /// Waiting on the child failed.
    #[error("wait process exit: {0}")]
    Wait(#[source] std::io::Error),

    /// The child survived SIGTERM past the grace period and was killed.
    #[error("process did not exit after SIGTERM")]
    HangAfterTerm,
}

/// Timeout and polling knobs for launches and teardown. The defaults are
/// the production budgets; tests construct shorter ones.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Cadence of TCP readiness probes.
    pub tcp_poll_interval: Duration,
    /// Number of TCP readiness probes before giving up.
    pub tcp_ready_attempts: u32,
    /// How long to wait for the stdio server's first preface byte.
    pub stdio_ready_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub term_grace: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            tcp_poll_interval: Duration::from_millis(100),
            tcp_ready_attempts: 50,
            stdio_ready_timeout: Duration::from_secs(10),
            term_grace: Duration::from_secs(3),
        }
    }
}

impl LaunchConfig {
    fn tcp_budget_secs(&self) -> u64 {
        (self.tcp_poll_interval * self.tcp_ready_attempts)
            .as_secs()
            .max(1)
    }
}

/// An ephemeral TCP server child and the address it listens on.
#[derive(Debug)]
pub struct TcpLaunch {
    /// The running child. The caller owns teardown via [`terminate`].
    pub child: Child,
    /// `127.0.0.1:<port>` the server accepted a probe on.
    pub address: String,
}

/// An ephemeral stdio server child and the pipe connection to it.
#[derive(Debug)]
pub struct StdioLaunch {
    /// The running child. The caller owns teardown via [`terminate`].
    pub child: Child,
    /// The single-use duplex connection over the child's pipes.
    pub conn: PipeConn,
}

/// Launches `<path> serve --listen tcp://:<port>` on a freshly allocated
/// port and polls until the server accepts connections.
///
/// # Errors
///
/// Fails on spawn errors, port allocation errors, or when the readiness
/// budget elapses (the child is killed before returning).
pub async fn launch_tcp(path: &Path, cfg: &LaunchConfig) -> Result<TcpLaunch, ProcessError> {
    // Briefly bind a listener to pick a free port, then release it for
    // the child.
    let probe = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(ProcessError::PortAllocation)?;
    let port = probe
        .local_addr()
        .map_err(ProcessError::PortAllocation)?
        .port();
    drop(probe);

    let mut child = Command::new(path)
        .args(["serve", "--listen", &format!("tcp://:{port}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| ProcessError::SpawnFailed {
            path: path.display().to_string(),
            source,
        })?;

    let address = format!("127.0.0.1:{port}");
    for _ in 0..cfg.tcp_ready_attempts {
        if TcpStream::connect(&address).await.is_ok() {
            tracing::debug!(%address, "holon server ready");
            return Ok(TcpLaunch { child, address });
        }
        tokio::time::sleep(cfg.tcp_poll_interval).await;
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
    Err(ProcessError::TcpReadyTimeout {
        path: path.display().to_string(),
        budget_secs: cfg.tcp_budget_secs(),
        port,
    })
}

/// Launches `<path> serve --listen stdio://` with piped stdin/stdout and
/// waits for the server's first byte (the HTTP/2 preface) to prove the
/// pipe is live.
///
/// # Errors
///
/// Fails on spawn errors, missing pipes, a closed pipe before the preface
/// byte, or when the readiness budget elapses. The child is killed on
/// every failure path.
pub async fn launch_stdio(path: &Path, cfg: &LaunchConfig) -> Result<StdioLaunch, ProcessError> {
    let mut child = Command::new(path)
        .args(["serve", "--listen", "stdio://"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| ProcessError::SpawnFailed {
            path: path.display().to_string(),
            source,
        })?;

    let mut stdout = child.stdout.take().ok_or(ProcessError::PipesUnavailable)?;
    let stdin = child.stdin.take().ok_or(ProcessError::PipesUnavailable)?;

    let mut first = [0u8; 1];
    let read = tokio::time::timeout(cfg.stdio_ready_timeout, stdout.read_exact(&mut first)).await;
    match read {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ProcessError::PrefaceRead(err));
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ProcessError::StdioReadyTimeout);
        }
    }

    Ok(StdioLaunch {
        child,
        conn: PipeConn::new(first.to_vec(), stdout, stdin),
    })
}

/// Spawns `<path> serve --listen <uri>` detached, returning the pid. The
/// child inherits stdout/stderr and outlives the dispatcher.
///
/// # Errors
///
/// Fails when the spawn itself fails.
pub fn spawn_persistent(path: &Path, listen_uri: &str) -> Result<u32, ProcessError> {
    // std::process keeps the child running when the handle is dropped.
    let child = std::process::Command::new(path)
        .args(["serve", "--listen", listen_uri])
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| ProcessError::SpawnFailed {
            path: path.display().to_string(),
            source,
        })?;
    Ok(child.id())
}

/// Terminates a child: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// An already-exited child is not an error.
///
/// # Errors
///
/// Fails when signalling or waiting fails, or with
/// [`ProcessError::HangAfterTerm`] when the child had to be killed.
pub async fn terminate(mut child: Child, grace: Duration) -> Result<(), ProcessError> {
    if let Some(pid) = child.id() {
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(err) => return Err(ProcessError::Signal(err)),
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(?status, "child exited after SIGTERM");
            Ok(())
        }
        Ok(Err(err)) => Err(ProcessError::Wait(err)),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(ProcessError::HangAfterTerm)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use super::*;

    fn short_config() -> LaunchConfig {
        LaunchConfig {
            tcp_poll_interval: Duration::from_millis(20),
            tcp_ready_attempts: 5,
            stdio_ready_timeout: Duration::from_millis(200),
            term_grace: Duration::from_millis(500),
        }
    }

    fn stub_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = launch_tcp(Path::new("/nonexistent/holon-binary"), &short_config())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn tcp_readiness_timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        // Never listens; readiness polling must give up.
        let script = stub_script(dir.path(), "sleeper", "sleep 5");

        let err = launch_tcp(&script, &short_config()).await.unwrap_err();
        assert!(matches!(err, ProcessError::TcpReadyTimeout { .. }));
        assert!(err.to_string().contains("did not start within"));
    }

    #[tokio::test]
    async fn stdio_preface_byte_is_rechained() {
        let dir = tempfile::tempdir().unwrap();
        let script = stub_script(dir.path(), "preface", "printf P; sleep 2");

        let launch = launch_stdio(&script, &short_config()).await.unwrap();
        let mut conn = launch.conn;
        let mut byte = [0u8; 1];
        conn.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"P");

        terminate(launch.child, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stdio_readiness_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = stub_script(dir.path(), "silent", "sleep 2");

        let err = launch_stdio(&script, &short_config()).await.unwrap_err();
        assert!(matches!(err, ProcessError::StdioReadyTimeout));
    }

    #[tokio::test]
    async fn stdio_early_exit_is_a_preface_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = stub_script(dir.path(), "quitter", "exit 0");

        let err = launch_stdio(&script, &short_config()).await.unwrap_err();
        assert!(matches!(err, ProcessError::PrefaceRead(_)));
    }

    #[tokio::test]
    async fn terminate_reaps_a_sleeping_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = stub_script(dir.path(), "napper", "sleep 10");
        let child = Command::new(&script).spawn().unwrap();

        terminate(child, Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn terminate_after_exit_is_not_an_error() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();

        terminate(child, Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn sigterm_ignorer_is_killed_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let script = stub_script(dir.path(), "stubborn", "trap '' TERM\nsleep 10");
        let child = Command::new(&script).spawn().unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = terminate(child, Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, ProcessError::HangAfterTerm));
    }
}
