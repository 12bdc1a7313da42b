//! Tool client — the single entry point for invoking tool-server tools.
//!
//! [`ToolClient::invoke`] hides the session plumbing: it starts the server on
//! first use, sends an MCP `tools/call`, waits for settlement, and decodes
//! the payload. Every failure comes back as [`AppError::Tool`] carrying the
//! tool name, the arguments, and the cause, so callers can decide on a
//! fallback.
//!
//! # Session states
//!
//! ```text
//! NotStarted → Starting → Ready → Stopping → Stopped
//!                  └──────── (start failure) ──────┘
//! ```
//!
//! `Stopped` is terminal: `invoke` fails immediately instead of hanging.
//! A server that dies on its own also moves the client to `Stopped`: the
//! dead session is shut down (reaping the process) as soon as its output
//! stream closes.

use std::future::Future;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::rpc::envelope::RpcError;
use crate::rpc::session::{SessionOptions, ToolSession};
use crate::rpc::supervisor::ServerSpec;
use crate::{AppError, Result};

/// Error code used when a tool reports failure through `isError`.
pub const TOOL_REPORTED_ERROR: i64 = -32000;

/// Lifecycle of the client's tool-server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No server has been spawned yet.
    NotStarted,
    /// The server is being spawned and initialized.
    Starting,
    /// Calls are accepted.
    Ready,
    /// Shutdown is in progress.
    Stopping,
    /// Terminal; no further calls are accepted.
    Stopped,
}

/// One entry of a `tools/list` result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Tool name, as passed to [`ToolClient::invoke`].
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// JSON schema of the tool's arguments.
    #[serde(default)]
    pub input_schema: Option<Value>,
}

struct Inner {
    spec: ServerSpec,
    options: SessionOptions,
    session: Mutex<Option<Arc<ToolSession>>>,
    state: watch::Sender<SessionState>,
}

/// Cloneable handle to a lazily started tool-server session.
#[derive(Clone)]
pub struct ToolClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ToolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolClient")
            .field("spec", &self.inner.spec)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ToolClient {
    /// Create a client that will spawn `spec` on first use.
    #[must_use]
    pub fn new(spec: ServerSpec, options: SessionOptions) -> Self {
        Self::with_slot(spec, options, None, SessionState::NotStarted)
    }

    /// Create a client from a loaded configuration.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.server_spec(), config.session_options())
    }

    /// Wrap an already running session; the client starts out `Ready`.
    #[must_use]
    pub fn from_session(session: ToolSession) -> Self {
        let session = Arc::new(session);
        let client = Self::with_slot(
            ServerSpec::default(),
            SessionOptions::default(),
            Some(Arc::clone(&session)),
            SessionState::Ready,
        );
        if tokio::runtime::Handle::try_current().is_ok() {
            client.watch_session(&session);
        }
        client
    }

    fn with_slot(
        spec: ServerSpec,
        options: SessionOptions,
        session: Option<Arc<ToolSession>>,
        state: SessionState,
    ) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            inner: Arc::new(Inner {
                spec,
                options,
                session: Mutex::new(session),
                state,
            }),
        }
    }

    /// Run `f` with a fresh client, then shut the client down whether `f`
    /// succeeded or not.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error if it failed, otherwise any shutdown error.
    pub async fn scoped<F, Fut, T>(config: &ClientConfig, f: F) -> Result<T>
    where
        F: FnOnce(ToolClient) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = Self::from_config(config);
        let outcome = f(client.clone()).await;
        let shutdown = client.shutdown().await;
        let value = outcome?;
        shutdown?;
        Ok(value)
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to session state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "tool client state changed");
        }
    }

    /// Start the session now instead of on the first call.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`] — the server could not be started.
    /// - [`AppError::SessionClosed`] — the client is already shut down.
    pub async fn start(&self) -> Result<()> {
        self.session().await.map(|_| ())
    }

    async fn session(&self) -> Result<Arc<ToolSession>> {
        let mut slot = self.inner.session.lock().await;

        if matches!(self.state(), SessionState::Stopping | SessionState::Stopped) {
            return Err(AppError::SessionClosed(
                "tool client is shut down; no further calls are accepted".into(),
            ));
        }

        if Self::retire_if_closed(&self.inner, &mut slot).await {
            return Err(AppError::SessionClosed(
                "tool server exited; the session is stopped".into(),
            ));
        }

        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }

        self.set_state(SessionState::Starting);
        match ToolSession::open(&self.inner.spec, &self.inner.options).await {
            Ok(session) => {
                let session = Arc::new(session);
                *slot = Some(Arc::clone(&session));
                self.set_state(SessionState::Ready);
                self.watch_session(&session);
                Ok(session)
            }
            Err(err) => {
                warn!(%err, command = %self.inner.spec.command, "tool session failed to start");
                self.set_state(SessionState::Stopped);
                Err(err)
            }
        }
    }

    /// Retire `session` once it closes on its own, without holding it alive.
    fn watch_session(&self, session: &ToolSession) {
        let closed = session.closed_signal();
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            closed.await;
            if let Some(inner) = inner.upgrade() {
                let mut slot = inner.session.lock().await;
                Self::retire_if_closed(&inner, &mut slot).await;
            }
        });
    }

    /// Shut down and drop a slotted session whose server is gone, moving the
    /// client to `Stopped`. Returns whether a session was retired.
    async fn retire_if_closed(inner: &Inner, slot: &mut Option<Arc<ToolSession>>) -> bool {
        if !slot.as_ref().is_some_and(|session| session.is_closed()) {
            return false;
        }
        let Some(session) = slot.take() else {
            return false;
        };

        warn!(session_id = session.session_id(), "tool server exited, stopping client");
        inner.state.send_replace(SessionState::Stopping);
        session.shutdown().await;
        inner.state.send_replace(SessionState::Stopped);
        true
    }

    /// Invoke `tool` with `arguments` and return its decoded result.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Tool`] wrapping the cause: `Spawn`, `Timeout`,
    /// `Protocol` (including tool-reported `isError` results), `Transport`,
    /// or `SessionClosed`.
    pub async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value> {
        match self.call_tool(tool, &arguments).await {
            Ok(value) => Ok(value),
            Err(source) => {
                warn!(tool, error = %source, "tool invocation failed");
                Err(AppError::Tool {
                    tool: tool.to_owned(),
                    arguments,
                    source: Box::new(source),
                })
            }
        }
    }

    async fn call_tool(&self, tool: &str, arguments: &Value) -> Result<Value> {
        let session = self.session().await?;
        let call = session
            .issue("tools/call", json!({ "name": tool, "arguments": arguments }))
            .await?;
        let id = call.id();
        let result = call.wait().await?;
        debug!(tool, id, "tool call settled");
        decode_tool_result(id, result)
    }

    /// List the tools the server offers.
    ///
    /// # Errors
    ///
    /// Any session or call failure, or [`AppError::Decode`] when the result
    /// has no well-formed `tools` array.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let session = self.session().await?;
        let result = session.call("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(tools)
            .map_err(|e| AppError::Decode(format!("malformed tools/list result: {e}")))
    }

    /// Shut the session down. Pending calls are rejected, the server is
    /// terminated, and the client becomes `Stopped`. Idempotent.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for teardown steps
    /// that can fail.
    pub async fn shutdown(&self) -> Result<()> {
        let mut slot = self.inner.session.lock().await;

        if self.state() == SessionState::Stopped {
            return Ok(());
        }

        self.set_state(SessionState::Stopping);
        if let Some(session) = slot.take() {
            session.shutdown().await;
        }
        self.set_state(SessionState::Stopped);
        info!("tool client shut down");
        Ok(())
    }
}

/// Unwrap an MCP `tools/call` result, honouring `isError`.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] with [`TOOL_REPORTED_ERROR`] when the
/// result carries `isError: true`.
pub fn decode_tool_result(id: u64, result: Value) -> Result<Value> {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let payload = decode_tool_payload(result);

    if is_error {
        let message = match &payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        return Err(AppError::Protocol {
            id,
            error: RpcError {
                code: TOOL_REPORTED_ERROR,
                message,
                data: Some(payload),
            },
        });
    }

    Ok(payload)
}

/// Decode a tool payload, tolerating one level of double encoding.
///
/// Some servers return structured data as a JSON string inside a text
/// content item. The wire protocol does not promise this shape, so every
/// step falls back:
///
/// - `{content: [{type: "text", text}, …]}` — the first text item is parsed
///   as JSON, or returned as a plain string if it does not parse.
/// - a JSON string — parsed once, or returned unchanged.
/// - anything else — returned unchanged.
#[must_use]
pub fn decode_tool_payload(result: Value) -> Value {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| {
            items.iter().find_map(|item| {
                let is_text = item.get("type").and_then(Value::as_str) == Some("text");
                item.get("text")
                    .and_then(Value::as_str)
                    .filter(|_| is_text)
                    .map(str::to_owned)
            })
        });

    match (text, result) {
        (Some(text), _) | (None, Value::String(text)) => parse_or_text(text),
        (None, other) => other,
    }
}

fn parse_or_text(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}
