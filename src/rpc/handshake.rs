//! MCP initialization handshake.
//!
//! After the startup grace period the session performs the MCP
//! initialize/initialized exchange:
//!
//! 1. **`initialize`** — an ordinary correlated call carrying the client's
//!    `protocolVersion`, `clientInfo`, and (empty) `capabilities`.
//! 2. **`notifications/initialized`** — a notification telling the server
//!    the client is ready for tool calls.
//!
//! Servers that do not implement the handshake can be driven with
//! `server.initialize = false`.

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::rpc::correlator::Correlator;
use crate::Result;

/// MCP protocol revision advertised in `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name advertised in `initialize`.
pub const CLIENT_NAME: &str = "pr-scribe";

/// Build the `initialize` request parameters.
#[must_use]
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION")
        },
        "capabilities": {}
    })
}

/// Run the handshake over `correlator` and return the server's
/// `initialize` result (its `serverInfo` and `capabilities`).
///
/// # Errors
///
/// Propagates the `initialize` call's failure (timeout, protocol error,
/// transport) or a transport failure while sending the notification.
pub async fn initialize(correlator: &Correlator, session_id: &str) -> Result<Value> {
    let call = correlator.issue("initialize", initialize_params()).await?;
    let server = call.wait().await?;

    let server_name = server
        .pointer("/serverInfo/name")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let server_version = server
        .pointer("/serverInfo/version")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    debug!(session_id, ?server, "handshake: initialize result");

    correlator
        .notify("notifications/initialized", None)
        .await?;

    info!(
        session_id,
        server_name, server_version, "handshake: tool server initialized"
    );
    Ok(server)
}
