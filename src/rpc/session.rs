//! One tool-server session: a process, its I/O tasks, and its correlator.
//!
//! # Lifecycle
//!
//! 1. [`ToolSession::open`] spawns the server and starts three tasks:
//!    writer (channel → stdin), reader (stdout → correlator), and
//!    diagnostics (stderr → log).
//! 2. It sleeps for the startup grace period; servers drop calls that
//!    arrive before their own startup finishes.
//! 3. Optionally performs the MCP handshake.
//! 4. Calls flow through [`ToolSession::issue`] / [`ToolSession::call`].
//! 5. [`ToolSession::shutdown`] rejects pending calls, stops the tasks and
//!    terminates the process. It is idempotent. Dropping the session
//!    without calling it still cancels the tasks, and `kill_on_drop` takes
//!    the process down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::codec::MAX_LINE_BYTES;
use crate::rpc::correlator::{Correlator, PendingCall, DEFAULT_CALL_TIMEOUT};
use crate::rpc::handshake;
use crate::rpc::reader::run_reader;
use crate::rpc::supervisor::{run_diagnostics, spawn_server, ServerProcess, ServerSpec};
use crate::rpc::writer::run_writer;
use crate::{AppError, Result};

/// Capacity of the outbound line channel.
const OUTBOUND_CAPACITY: usize = 64;

/// Reason attached to calls rejected by an explicit shutdown.
pub const SHUTDOWN_REASON: &str = "session shut down";

/// Timing and framing knobs for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Budget for each call.
    pub call_timeout: Duration,
    /// Delay between spawn and the first call.
    pub startup_grace: Duration,
    /// How long `shutdown` waits after SIGTERM before killing.
    pub stop_grace: Duration,
    /// Maximum inbound line length in bytes.
    pub max_line_bytes: usize,
    /// Whether to run the MCP initialize handshake.
    pub initialize: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            startup_grace: Duration::from_secs(2),
            stop_grace: Duration::from_secs(2),
            max_line_bytes: MAX_LINE_BYTES,
            initialize: true,
        }
    }
}

/// A live connection to one tool server.
#[derive(Debug)]
pub struct ToolSession {
    session_id: String,
    correlator: Arc<Correlator>,
    cancel: CancellationToken,
    process: Mutex<Option<ServerProcess>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop_grace: Duration,
    closed: AtomicBool,
    server_info: Option<Value>,
}

impl ToolSession {
    /// Spawn the server described by `spec` and bring the session up.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`] — the process could not be started.
    /// - Any error from the MCP handshake; the session is torn down first.
    pub async fn open(spec: &ServerSpec, options: &SessionOptions) -> Result<Self> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut process = spawn_server(spec)?;

        let (Some(stdin), Some(stdout)) = (process.stdin.take(), process.stdout.take()) else {
            process.stop(&session_id, options.stop_grace).await;
            return Err(AppError::Spawn("server pipes were not captured".into()));
        };
        let stderr = process.stderr.take();

        info!(session_id, command = %spec.command, "tool session starting");
        Self::start(session_id, stdin, stdout, stderr, Some(process), options).await
    }

    /// Bring a session up over already-open streams, with no process to
    /// supervise. Used for in-process servers and scripted tests.
    ///
    /// # Errors
    ///
    /// Any error from the MCP handshake when `options.initialize` is set.
    pub async fn connect<W, R>(stdin: W, stdout: R, options: &SessionOptions) -> Result<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let session_id = uuid::Uuid::new_v4().to_string();
        Self::start::<W, R, tokio::process::ChildStderr>(
            session_id, stdin, stdout, None, None, options,
        )
        .await
    }

    /// Like [`ToolSession::connect`], with `stderr` drained as diagnostics.
    ///
    /// # Errors
    ///
    /// Any error from the MCP handshake when `options.initialize` is set.
    pub async fn connect_with_stderr<W, R, E>(
        stdin: W,
        stdout: R,
        stderr: E,
        options: &SessionOptions,
    ) -> Result<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let session_id = uuid::Uuid::new_v4().to_string();
        Self::start(session_id, stdin, stdout, Some(stderr), None, options).await
    }

    async fn start<W, R, E>(
        session_id: String,
        stdin: W,
        stdout: R,
        stderr: Option<E>,
        process: Option<ServerProcess>,
        options: &SessionOptions,
    ) -> Result<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (line_tx, line_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let correlator = Arc::new(Correlator::new(
            session_id.clone(),
            line_tx,
            options.call_timeout,
        ));

        let mut tasks = Vec::with_capacity(3);

        let writer_correlator = Arc::clone(&correlator);
        let writer_cancel = cancel.clone();
        let writer_session = session_id.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) =
                run_writer(writer_session.clone(), stdin, line_rx, writer_cancel).await
            {
                warn!(session_id = %writer_session, %err, "rpc writer stopped");
                writer_correlator
                    .close(&format!("tool server input failed: {err}"))
                    .await;
            }
        }));

        tasks.push(tokio::spawn(run_reader(
            session_id.clone(),
            stdout,
            options.max_line_bytes,
            Arc::clone(&correlator),
            cancel.clone(),
        )));

        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(run_diagnostics(
                session_id.clone(),
                stderr,
                options.max_line_bytes,
                cancel.clone(),
            )));
        }

        let mut session = Self {
            session_id,
            correlator,
            cancel,
            process: Mutex::new(process),
            tasks: Mutex::new(tasks),
            stop_grace: options.stop_grace,
            closed: AtomicBool::new(false),
            server_info: None,
        };

        if !options.startup_grace.is_zero() {
            debug!(
                session_id = %session.session_id,
                grace_ms = u64::try_from(options.startup_grace.as_millis()).unwrap_or(u64::MAX),
                "waiting for tool server startup"
            );
            tokio::time::sleep(options.startup_grace).await;
        }

        if options.initialize {
            match handshake::initialize(&session.correlator, &session.session_id).await {
                Ok(info) => session.server_info = Some(info),
                Err(err) => {
                    warn!(session_id = %session.session_id, %err, "handshake failed");
                    session.shutdown().await;
                    return Err(err);
                }
            }
        }

        info!(session_id = %session.session_id, "tool session ready");
        Ok(session)
    }

    /// Identifier used in every log line of this session.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The server's `initialize` result, if the handshake ran.
    #[must_use]
    pub fn server_info(&self) -> Option<&Value> {
        self.server_info.as_ref()
    }

    /// Whether the session can no longer carry calls: [`ToolSession::shutdown`]
    /// has run, or the server's streams closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.correlator.is_closed()
    }

    /// A future that resolves once the session is closed (see
    /// [`ToolSession::is_closed`]) or dropped. It does not borrow the session.
    pub fn closed_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let closed = self.correlator.closed_signal();
        let cancel = self.cancel.clone();
        async move {
            tokio::select! {
                () = closed.cancelled() => {}
                () = cancel.cancelled() => {}
            }
        }
    }

    /// Number of calls awaiting settlement.
    pub async fn pending_count(&self) -> usize {
        self.correlator.pending_count().await
    }

    /// Issue a call without waiting for it. Several calls may be in flight.
    ///
    /// # Errors
    ///
    /// - [`AppError::SessionClosed`] — the session is shut down.
    /// - [`AppError::Transport`] — the writer is gone.
    pub async fn issue(&self, method: &str, params: Value) -> Result<PendingCall> {
        // A dead server is reported by the correlator with its own reason.
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::SessionClosed(format!(
                "session {} is shut down; {method} not sent",
                self.session_id
            )));
        }
        self.correlator.issue(method, params).await
    }

    /// Issue a call and wait for its settlement.
    ///
    /// # Errors
    ///
    /// See [`ToolSession::issue`] and [`PendingCall::wait`].
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.issue(method, params).await?.wait().await
    }

    /// Tear the session down: reject pending calls, stop the I/O tasks,
    /// and terminate the server. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!(session_id = %self.session_id, "shutdown: already closed");
            return;
        }

        let rejected = self.correlator.close(SHUTDOWN_REASON).await;
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                debug!(session_id = %self.session_id, %err, "session task ended abnormally");
            }
        }

        if let Some(mut process) = self.process.lock().await.take() {
            process.stop(&self.session_id, self.stop_grace).await;
        }

        info!(session_id = %self.session_id, rejected, "tool session stopped");
    }
}

impl Drop for ToolSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
