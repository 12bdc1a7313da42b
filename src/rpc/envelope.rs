//! JSON-RPC 2.0 envelopes exchanged with the tool server.
//!
//! Outbound: [`RpcRequest`] (carries an `id`, expects a response) and
//! [`RpcNotification`] (no `id`, fire-and-forget). Inbound: [`RpcResponse`],
//! decoded from a single NDJSON line by [`parse_inbound_line`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// Protocol version tag carried in every outbound envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound request envelope (client → server).
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    /// Always [`JSONRPC_VERSION`].
    pub jsonrpc: &'static str,
    /// Correlation id, unique among the session's outstanding calls.
    pub id: u64,
    /// Method name (e.g. `tools/call`).
    pub method: &'a str,
    /// Method parameters.
    pub params: &'a Value,
}

impl<'a> RpcRequest<'a> {
    /// Build a request envelope.
    #[must_use]
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Outbound notification envelope (client → server, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct RpcNotification<'a> {
    /// Always [`JSONRPC_VERSION`].
    pub jsonrpc: &'static str,
    /// Notification method name.
    pub method: &'a str,
    /// Optional parameters; omitted from the wire when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> RpcNotification<'a> {
    /// Build a notification envelope.
    #[must_use]
    pub fn new(method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional server-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Outcome carried by a response: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Successful call result.
    Result(Value),
    /// Explicit server error.
    Error(RpcError),
}

/// Inbound response envelope (server → client).
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    /// Correlation id echoed from the request.
    pub id: u64,
    /// Result or error.
    pub payload: ResponsePayload,
}

/// Raw wire shape; validated into [`RpcResponse`] or an [`InboundLine`] variant.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    // `Some(Value::Null)` must stay distinguishable from an absent field.
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Classification of a decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    /// A response to one of our calls.
    Response(RpcResponse),
    /// A server-initiated request or notification; not ours to settle.
    ServerMessage {
        /// Method named by the server.
        method: String,
    },
}

/// Parse one NDJSON line from the tool server's stdout.
///
/// # Errors
///
/// - [`AppError::Decode`]`("malformed json: …")` — not valid JSON or not an object.
/// - [`AppError::Decode`]`("…")` — an envelope with a non-numeric id, both or
///   neither of `result`/`error`, or no id at all.
pub fn parse_inbound_line(line: &str) -> Result<InboundLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(AppError::Decode("empty line".into()));
    }

    let raw: RawEnvelope = serde_json::from_str(trimmed)
        .map_err(|e| AppError::Decode(format!("malformed json: {e}")))?;

    if raw.result.is_none() && raw.error.is_none() {
        if let Some(method) = raw.method {
            return Ok(InboundLine::ServerMessage { method });
        }
    }

    let id = match raw.id {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| AppError::Decode(format!("id is not an unsigned integer: {n}")))?,
        // Some servers echo numeric ids back as strings.
        Some(Value::String(s)) => s
            .parse::<u64>()
            .map_err(|_| AppError::Decode(format!("id is not numeric: {s:?}")))?,
        Some(other) => return Err(AppError::Decode(format!("unsupported id: {other}"))),
        None => return Err(AppError::Decode("envelope has no id".into())),
    };

    let payload = match (raw.result, raw.error) {
        (Some(result), None) => ResponsePayload::Result(result),
        (None, Some(error)) => ResponsePayload::Error(error),
        (Some(_), Some(_)) => {
            return Err(AppError::Decode(format!(
                "response {id} carries both result and error"
            )))
        }
        (None, None) => {
            return Err(AppError::Decode(format!(
                "response {id} carries neither result nor error"
            )))
        }
    };

    Ok(InboundLine::Response(RpcResponse { id, payload }))
}

/// Serialise `value` as one compact NDJSON line (without the trailing `\n`).
///
/// # Errors
///
/// Returns [`AppError::Transport`] if serialisation fails.
pub fn to_line<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| AppError::Transport(format!("failed to serialise outbound message: {e}")))
}
