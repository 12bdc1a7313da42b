//! Client configuration parsing, validation, and credential loading.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::rpc::codec::MAX_LINE_BYTES;
use crate::rpc::session::SessionOptions;
use crate::rpc::supervisor::ServerSpec;
use crate::{AppError, Result};

/// Keyring service name under which the access token may be stored.
pub const KEYRING_SERVICE: &str = "pr-scribe";

/// Keyring entry holding the access token.
pub const KEYRING_TOKEN_KEY: &str = "github_token";

/// Host environment variable consulted when the keychain has no token.
pub const TOKEN_ENV_VAR: &str = "PR_SCRIBE_TOKEN";

/// How to launch the tool server.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Tool-server executable (e.g. `github-mcp-server`).
    pub command: String,
    /// Arguments for the executable.
    #[serde(default = "default_server_args")]
    pub args: Vec<String>,
    /// Environment variable through which the child receives the token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Working directory for the child process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Whether to run the MCP initialize handshake after startup.
    #[serde(default = "default_true")]
    pub initialize: bool,
    /// Additional non-secret variables passed to the child.
    #[serde(default)]
    pub extra_env: Vec<EnvVar>,
}

/// A single `KEY=value` pair for the child environment.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

fn default_server_args() -> Vec<String> {
    vec!["stdio".into()]
}

fn default_token_env() -> String {
    "GITHUB_PERSONAL_ACCESS_TOKEN".into()
}

fn default_true() -> bool {
    true
}

/// Timeouts for calls and process lifecycle.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Per-call response budget.
    #[serde(default = "default_call_seconds")]
    pub call_seconds: u64,
    /// Delay between spawn and the first call.
    #[serde(default = "default_startup_grace_millis")]
    pub startup_grace_millis: u64,
    /// Delay between SIGTERM and SIGKILL on shutdown.
    #[serde(default = "default_stop_grace_millis")]
    pub stop_grace_millis: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_seconds: default_call_seconds(),
            startup_grace_millis: default_startup_grace_millis(),
            stop_grace_millis: default_stop_grace_millis(),
        }
    }
}

fn default_call_seconds() -> u64 {
    30
}

fn default_startup_grace_millis() -> u64 {
    2000
}

fn default_stop_grace_millis() -> u64 {
    2000
}

/// Stream limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LimitsConfig {
    /// Maximum inbound line length in bytes.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

fn default_max_line_bytes() -> usize {
    MAX_LINE_BYTES
}

/// Client configuration parsed from `config.toml`.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Tool-server launch settings.
    pub server: ServerConfig,
    /// Call and lifecycle timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Stream limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Access token handed to the child (populated at runtime).
    #[serde(skip)]
    pub token: Option<String>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server", &self.server)
            .field("timeouts", &self.timeouts)
            .field("limits", &self.limits)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for `command` with every other setting at its default.
    #[must_use]
    pub fn for_command(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            server: ServerConfig {
                command: command.into(),
                args,
                token_env: default_token_env(),
                working_dir: None,
                initialize: true,
                extra_env: Vec::new(),
            },
            timeouts: TimeoutConfig::default(),
            limits: LimitsConfig::default(),
            token: None,
        }
    }

    /// Load the access token from OS keychain with env-var fallback.
    ///
    /// Tries the `pr-scribe` keyring service, then [`TOKEN_ENV_VAR`], then
    /// the variable named by `server.token_env` in the host environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no source provides a token.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.token = Some(load_token(&self.server.token_env).await?);
        Ok(())
    }

    /// Process description for the supervisor. The token, when loaded, is
    /// placed under `server.token_env`.
    #[must_use]
    pub fn server_spec(&self) -> ServerSpec {
        let mut env: Vec<(String, String)> = self
            .server
            .extra_env
            .iter()
            .map(|var| (var.name.clone(), var.value.clone()))
            .collect();
        if let Some(token) = &self.token {
            env.push((self.server.token_env.clone(), token.clone()));
        }

        ServerSpec {
            command: self.server.command.clone(),
            args: self.server.args.clone(),
            env,
            working_dir: self.server.working_dir.clone(),
        }
    }

    /// Session timing and framing derived from this configuration.
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            call_timeout: Duration::from_secs(self.timeouts.call_seconds),
            startup_grace: Duration::from_millis(self.timeouts.startup_grace_millis),
            stop_grace: Duration::from_millis(self.timeouts.stop_grace_millis),
            max_line_bytes: self.limits.max_line_bytes,
            initialize: self.server.initialize,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.server.command.trim().is_empty() {
            return Err(AppError::Config("server.command must not be empty".into()));
        }

        if self.server.token_env.trim().is_empty() {
            return Err(AppError::Config(
                "server.token_env must not be empty".into(),
            ));
        }

        if self
            .server
            .extra_env
            .iter()
            .any(|var| var.name == self.server.token_env)
        {
            return Err(AppError::Config(format!(
                "server.extra_env must not set {}; the token is loaded from the keychain or \
                 environment",
                self.server.token_env
            )));
        }

        if self.timeouts.call_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.call_seconds must be greater than zero".into(),
            ));
        }

        if self.limits.max_line_bytes == 0 {
            return Err(AppError::Config(
                "limits.max_line_bytes must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Load the access token from OS keychain with env-var fallback.
///
/// # Errors
///
/// Returns `AppError::Config` if neither the keychain, [`TOKEN_ENV_VAR`],
/// nor `token_env` provides a non-empty value.
pub async fn load_token(token_env: &str) -> Result<String> {
    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(|| {
        keyring::Entry::new(KEYRING_SERVICE, KEYRING_TOKEN_KEY).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = KEYRING_TOKEN_KEY, "keychain entry is empty, trying env vars");
        }
        Err(err) => {
            warn!(
                key = KEYRING_TOKEN_KEY,
                ?err,
                "keychain lookup failed, trying env vars"
            );
        }
    }

    [TOKEN_ENV_VAR, token_env]
        .into_iter()
        .find_map(|key| env::var(key).ok().filter(|value| !value.is_empty()))
        .ok_or_else(|| {
            AppError::Config(format!(
                "access token not found in keychain, {TOKEN_ENV_VAR}, or {token_env}"
            ))
        })
}
