//! Error types shared across the crate.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde_json::Value;

use crate::rpc::envelope::RpcError;

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of a tool-server session.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing, validation, or credential loading failure.
    Config(String),
    /// The tool-server process could not be started. Fatal for the session.
    Spawn(String),
    /// No response arrived for call `id` within `after`.
    Timeout {
        /// Correlation id of the timed-out call.
        id: u64,
        /// Method the call was issued for.
        method: String,
        /// Budget that elapsed.
        after: Duration,
    },
    /// The server answered call `id` with an explicit error object.
    Protocol {
        /// Correlation id of the failed call.
        id: u64,
        /// Server-provided error payload.
        error: RpcError,
    },
    /// Writing to the server failed or the writer task is gone.
    Transport(String),
    /// The session is stopped, or the call was rejected by teardown.
    SessionClosed(String),
    /// A line could not be decoded as a response envelope.
    Decode(String),
    /// An inbound line exceeded the configured maximum length (bytes).
    StreamTooLong(usize),
    /// File-system or I/O operation failure.
    Io(String),
    /// A tool invocation failed; wraps the underlying cause.
    Tool {
        /// Tool name passed to `invoke`.
        tool: String,
        /// Arguments passed to `invoke`, kept for fallback diagnostics.
        arguments: Value,
        /// Underlying cause.
        source: Box<AppError>,
    },
}

impl AppError {
    /// The innermost cause, looking through [`AppError::Tool`] wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &AppError {
        match self {
            Self::Tool { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether the (root) cause is a call timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Self::Timeout { .. })
    }

    /// Whether the (root) cause is an explicit server error.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self.root_cause(), Self::Protocol { .. })
    }

    /// Whether the session that produced this error can no longer be used.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::Spawn(_) | Self::SessionClosed(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Timeout { id, method, after } => {
                write!(f, "timeout: call {id} ({method}) timed out after {after:?}")
            }
            Self::Protocol { id, error } => write!(
                f,
                "protocol: call {id} failed with code {}: {}",
                error.code, error.message
            ),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::SessionClosed(msg) => write!(f, "session closed: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
            Self::StreamTooLong(max) => {
                write!(f, "stream too long: line exceeded {max} bytes")
            }
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Tool { tool, source, .. } => write!(f, "tool {tool}: {source}"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tool { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
