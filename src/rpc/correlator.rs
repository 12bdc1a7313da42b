//! Request correlator: the per-session pending-call table.
//!
//! Every outbound call gets a fresh id from a monotonic counter and an entry
//! in the table holding its [`oneshot`] sender and the abort handle of its
//! timeout task. Whoever removes the entry settles the call: the reader on a
//! matching response, the timer when the budget elapses, or
//! [`Correlator::close`] on teardown. Removal happens under the table
//! lock, so each call is settled exactly once.
//!
//! The correlator never touches the child process directly. Outbound lines
//! go to the writer task through an [`mpsc`] channel; inbound lines are fed
//! in by the reader task through [`Correlator::handle_line`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::envelope::{
    parse_inbound_line, to_line, InboundLine, ResponsePayload, RpcNotification, RpcRequest,
};
use crate::{AppError, Result};

/// Default per-call budget.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A registered, not yet settled call.
#[derive(Debug)]
struct PendingEntry {
    method: String,
    issued_at: DateTime<Utc>,
    tx: oneshot::Sender<Result<Value>>,
    timer: AbortHandle,
}

type PendingTable = Arc<Mutex<HashMap<u64, PendingEntry>>>;

/// What [`Correlator::handle_line`] did with a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// The line answered the pending call with this id.
    Settled(u64),
    /// A well-formed response whose id matches no pending call.
    Stale(u64),
    /// Not a response envelope (diagnostic text, server notification, …).
    Ignored,
}

/// Handle to one issued call; resolves when the call is settled.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    method: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    /// Correlation id assigned to this call.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Method this call was issued for.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait until the call is settled.
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`] — the server answered with an error object.
    /// - [`AppError::Timeout`] — no response within the call's budget.
    /// - [`AppError::SessionClosed`] — the session was torn down first.
    pub async fn wait(self) -> Result<Value> {
        self.rx.await.unwrap_or_else(|_| {
            Err(AppError::SessionClosed(format!(
                "call {} ({}) was dropped without a response",
                self.id, self.method
            )))
        })
    }
}

/// Pending-call table plus id allocation for one tool-server session.
#[derive(Debug)]
pub struct Correlator {
    session_id: String,
    next_id: AtomicU64,
    pending: PendingTable,
    outbound: mpsc::Sender<String>,
    default_timeout: Duration,
    // Written only while `pending` is locked.
    closed: OnceLock<String>,
    closed_signal: CancellationToken,
}

impl Correlator {
    /// Create a correlator that writes outbound lines to `outbound`.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        outbound: mpsc::Sender<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbound,
            default_timeout,
            closed: OnceLock::new(),
            closed_signal: CancellationToken::new(),
        }
    }

    /// Budget applied by [`Correlator::issue`].
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Issue a call with the default budget.
    ///
    /// # Errors
    ///
    /// See [`Correlator::issue_with_timeout`].
    pub async fn issue(&self, method: &str, params: Value) -> Result<PendingCall> {
        self.issue_with_timeout(method, params, self.default_timeout)
            .await
    }

    /// Register a call, arm its timer, and hand the request to the writer.
    ///
    /// The entry is registered before the request is written, so a response
    /// can never arrive ahead of its entry.
    ///
    /// # Errors
    ///
    /// - [`AppError::SessionClosed`] — [`Correlator::close`] already ran.
    /// - [`AppError::Transport`] — serialisation failed or the writer channel
    ///   is closed; the entry is withdrawn before returning.
    pub async fn issue_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<PendingCall> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = to_line(&RpcRequest::new(id, method, &params))?;
        let (tx, rx) = oneshot::channel();

        {
            // The timer needs this lock to expire the entry, so arming it
            // while the lock is held guarantees the entry exists first.
            let mut pending = self.pending.lock().await;
            if let Some(reason) = self.closed.get() {
                return Err(AppError::SessionClosed(format!(
                    "call {id} ({method}) not sent: {reason}"
                )));
            }
            let timer = self.arm_timer(id, timeout);
            pending.insert(
                id,
                PendingEntry {
                    method: method.to_owned(),
                    issued_at: Utc::now(),
                    tx,
                    timer,
                },
            );
        }

        if self.outbound.send(line).await.is_err() {
            if let Some(entry) = self.pending.lock().await.remove(&id) {
                entry.timer.abort();
            }
            return Err(AppError::Transport(format!(
                "writer for session {} is closed; call {id} ({method}) not sent",
                self.session_id
            )));
        }

        debug!(session_id = %self.session_id, id, method, "correlator: call issued");

        Ok(PendingCall {
            id,
            method: method.to_owned(),
            rx,
        })
    }

    /// Send a notification; nothing is registered and nothing is awaited.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if the writer channel is closed.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let line = to_line(&RpcNotification::new(method, params.as_ref()))?;
        self.outbound.send(line).await.map_err(|_| {
            AppError::Transport(format!(
                "writer for session {} is closed; notification {method} not sent",
                self.session_id
            ))
        })
    }

    /// Feed one inbound line. Never fails: non-envelope lines and stale
    /// responses are logged and dropped.
    pub async fn handle_line(&self, line: &str) -> LineOutcome {
        let response = match parse_inbound_line(line) {
            Ok(InboundLine::Response(response)) => response,
            Ok(InboundLine::ServerMessage { method }) => {
                debug!(
                    session_id = %self.session_id,
                    method, "correlator: ignoring server-initiated message"
                );
                return LineOutcome::Ignored;
            }
            Err(e) => {
                debug!(
                    session_id = %self.session_id,
                    error = %e,
                    raw_line = %line,
                    "correlator: not a response envelope, skipping line"
                );
                return LineOutcome::Ignored;
            }
        };

        let id = response.id;
        let Some(entry) = self.pending.lock().await.remove(&id) else {
            debug!(
                session_id = %self.session_id,
                id, "correlator: stale or foreign response discarded"
            );
            return LineOutcome::Stale(id);
        };

        entry.timer.abort();

        let elapsed_ms = (Utc::now() - entry.issued_at).num_milliseconds();
        let outcome = match response.payload {
            ResponsePayload::Result(value) => {
                debug!(
                    session_id = %self.session_id,
                    id, method = %entry.method, elapsed_ms, "correlator: call succeeded"
                );
                Ok(value)
            }
            ResponsePayload::Error(error) => {
                warn!(
                    session_id = %self.session_id,
                    id,
                    method = %entry.method,
                    elapsed_ms,
                    code = error.code,
                    message = %error.message,
                    "correlator: call failed with server error"
                );
                Err(AppError::Protocol { id, error })
            }
        };

        if entry.tx.send(outcome).is_err() {
            debug!(
                session_id = %self.session_id,
                id, "correlator: caller stopped waiting before settlement"
            );
        }

        LineOutcome::Settled(id)
    }

    /// Settle every pending call as failed with [`AppError::SessionClosed`].
    ///
    /// Returns how many calls were rejected. Safe to call repeatedly. New
    /// calls are still accepted afterwards; see [`Correlator::close`].
    pub async fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<(u64, PendingEntry)> = self.pending.lock().await.drain().collect();
        self.reject_drained(drained, reason)
    }

    /// Reject every pending call and refuse all future ones.
    ///
    /// The first reason given wins; later calls only drain stragglers.
    pub async fn close(&self, reason: &str) -> usize {
        let drained: Vec<(u64, PendingEntry)> = {
            let mut pending = self.pending.lock().await;
            let _ = self.closed.set(reason.to_owned());
            pending.drain().collect()
        };
        self.closed_signal.cancel();
        self.reject_drained(drained, reason)
    }

    /// Whether [`Correlator::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    /// Token cancelled when [`Correlator::close`] runs.
    #[must_use]
    pub fn closed_signal(&self) -> CancellationToken {
        self.closed_signal.clone()
    }

    /// Number of calls currently awaiting settlement.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn reject_drained(&self, drained: Vec<(u64, PendingEntry)>, reason: &str) -> usize {
        let count = drained.len();

        for (id, entry) in drained {
            entry.timer.abort();
            let _ = entry.tx.send(Err(AppError::SessionClosed(format!(
                "call {id} ({}) rejected: {reason}",
                entry.method
            ))));
        }

        if count > 0 {
            warn!(
                session_id = %self.session_id,
                count, reason, "correlator: rejected pending calls"
            );
        }

        count
    }

    fn arm_timer(&self, id: u64, timeout: Duration) -> AbortHandle {
        let pending = Arc::clone(&self.pending);
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let Some(entry) = pending.lock().await.remove(&id) else {
                return;
            };

            warn!(
                session_id = %session_id,
                id,
                method = %entry.method,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "correlator: call timed out"
            );

            let _ = entry.tx.send(Err(AppError::Timeout {
                id,
                method: entry.method,
                after: timeout,
            }));
        })
        .abort_handle()
    }
}
