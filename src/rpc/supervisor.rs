//! Tool-server process supervisor.
//!
//! Spawns the tool server with:
//! - three independent pipes (stdin, stdout, stderr);
//! - `kill_on_drop(true)` so the process dies with its handle on every exit
//!   path, including panics;
//! - `env_clear()` + a safe allowlist, plus the explicit variables of the
//!   [`ServerSpec`] (which is how the bearer token reaches the child).
//!
//! Stderr is diagnostic output only. [`run_diagnostics`] drains it into
//! `tracing` and never parses it.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::codec::{frame_lines, Frame};
use crate::{AppError, Result};

/// Host environment variables inherited by the tool server.
///
/// Everything else is stripped before the child is launched.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "LANG",
    "SSL_CERT_FILE",
    "SSL_CERT_DIR",
    "HTTPS_PROXY",
    "NO_PROXY",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// How to launch the tool server.
#[derive(Clone, Default)]
pub struct ServerSpec {
    /// Executable (e.g. `github-mcp-server`).
    pub command: String,
    /// Arguments (e.g. `["stdio"]`).
    pub args: Vec<String>,
    /// Explicit environment variables. Values are never logged.
    pub env: Vec<(String, String)>,
    /// Working directory; inherits the host's when `None`.
    pub working_dir: Option<PathBuf>,
}

impl std::fmt::Debug for ServerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("ServerSpec")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env_keys", &env_keys)
            .field("working_dir", &self.working_dir)
            .finish()
    }
}

/// A running tool server and its captured pipes.
///
/// The pipes are `Option`s so the session can move each one into the task
/// that owns it.
#[derive(Debug)]
pub struct ServerProcess {
    /// Child handle; `kill_on_drop` is set.
    pub child: Child,
    /// Server stdin (requests go here).
    pub stdin: Option<ChildStdin>,
    /// Server stdout (responses come from here).
    pub stdout: Option<ChildStdout>,
    /// Server stderr (diagnostics).
    pub stderr: Option<ChildStderr>,
}

/// Spawn the tool server described by `spec`.
///
/// No retry: the server binary is either present or fatally absent.
///
/// # Errors
///
/// - [`AppError::Spawn`]`("failed to spawn …")` — OS spawn failure.
/// - [`AppError::Spawn`]`("failed to capture …")` — a pipe was not created.
pub fn spawn_server(spec: &ServerSpec) -> Result<ServerProcess> {
    if spec.command.trim().is_empty() {
        return Err(AppError::Spawn("server command must not be empty".into()));
    }

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args);

    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    for (key, val) in &spec.env {
        cmd.env(key, val);
    }

    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn {}: {err}", spec.command)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture server stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture server stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture server stderr".into()))?;

    info!(
        command = %spec.command,
        args = ?spec.args,
        pid = child.id(),
        env_keys = ?spec.env.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
        "tool server spawned"
    );

    Ok(ServerProcess {
        child,
        stdin: Some(stdin),
        stdout: Some(stdout),
        stderr: Some(stderr),
    })
}

impl ServerProcess {
    /// Terminate the server: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// On non-unix targets the process is killed immediately. A process that
    /// already exited is reaped and reported at `DEBUG`.
    pub async fn stop(&mut self, session_id: &str, grace: Duration) {
        // Dropping the pipes we still hold closes them.
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(session_id, %status, "tool server already exited");
                return;
            }
            Ok(None) => {}
            Err(err) => warn!(session_id, %err, "failed to poll tool server status"),
        }

        #[cfg(unix)]
        {
            if request_terminate(&self.child, session_id) {
                match tokio::time::timeout(grace, self.child.wait()).await {
                    Ok(Ok(status)) => {
                        info!(session_id, %status, "tool server exited after SIGTERM");
                        return;
                    }
                    Ok(Err(err)) => warn!(session_id, %err, "error waiting for tool server"),
                    Err(_) => warn!(
                        session_id,
                        grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                        "tool server ignored SIGTERM, killing"
                    ),
                }
            }
        }

        #[cfg(not(unix))]
        let _ = grace;

        if let Err(err) = self.child.kill().await {
            warn!(session_id, %err, "failed to kill tool server");
        } else {
            info!(session_id, "tool server killed");
        }
    }
}

/// Send SIGTERM; returns `false` when there is no pid to signal.
#[cfg(unix)]
fn request_terminate(child: &Child, session_id: &str) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return false;
    };

    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            warn!(session_id, %err, "failed to send SIGTERM to tool server");
            false
        }
    }
}

/// Diagnostics task — forwards each stderr line to the log.
///
/// Stderr is framed with the same codec as stdout but never parsed as
/// protocol. Oversized and non-UTF-8 lines are skipped and draining
/// continues, so the server never blocks or gets `EPIPE` on a full or
/// closed pipe. Runs until EOF, a read error, or cancellation. Lines are
/// logged at `INFO` under the `tool_server` target so they can be filtered
/// separately.
pub async fn run_diagnostics<R>(
    session_id: String,
    stderr: R,
    max_line_bytes: usize,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut frames = frame_lines(stderr, max_line_bytes);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            frame = frames.next() => match frame {
                Some(Ok(Frame::Line(line))) => {
                    let line = line.trim_end();
                    if !line.is_empty() {
                        info!(target: "tool_server", session_id, "{line}");
                    }
                }
                Some(Ok(Frame::Oversized(max))) => {
                    debug!(session_id, max, "tool server stderr line too long, skipped");
                }
                Some(Ok(Frame::NotUtf8)) => {
                    debug!(session_id, "tool server stderr line not UTF-8, skipped");
                }
                Some(Err(err)) => {
                    debug!(session_id, %err, "tool server stderr unreadable, stopping");
                    break;
                }
                None => {
                    debug!(session_id, "tool server stderr closed");
                    break;
                }
            },
        }
    }
}
