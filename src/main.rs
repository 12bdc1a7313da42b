#![forbid(unsafe_code)]

//! `pr-scribe` — command-line front end for the tool-server client.
//!
//! Loads configuration, resolves the access token, spawns the tool server,
//! runs one command against it, and always shuts the server down.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pr_scribe::{AppError, ClientConfig, Result, ToolClient};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "pr-scribe", about = "Call tools on a subprocess tool server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json). Logs go to stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Skip credential lookup (for servers that need no token).
    #[arg(long)]
    no_token: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Invoke one tool and print its result as JSON.
    Call {
        /// Tool name (e.g. `get_file_contents`).
        tool: String,

        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// List the tools the server offers.
    Tools,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = ClientConfig::load_from_path(&args.config)?;
    if !args.no_token {
        config.load_credentials().await?;
    }
    info!(command = %config.server.command, "configuration loaded");

    let command = args.command;
    let output = ToolClient::scoped(&config, |client| async move {
        tokio::select! {
            result = execute(&client, command) => result,
            () = shutdown_signal() => {
                warn!("interrupted, shutting down tool server");
                Err(AppError::SessionClosed("interrupted".into()))
            }
        }
    })
    .await?;

    let rendered = serde_json::to_string_pretty(&output)
        .map_err(|err| AppError::Io(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn execute(client: &ToolClient, command: Command) -> Result<Value> {
    match command {
        Command::Call { tool, args } => {
            let arguments: Value = serde_json::from_str(&args)
                .map_err(|err| AppError::Config(format!("--args is not valid JSON: {err}")))?;
            if !arguments.is_object() {
                return Err(AppError::Config("--args must be a JSON object".into()));
            }
            client.invoke(&tool, arguments).await
        }
        Command::Tools => {
            let tools = client.list_tools().await?;
            Ok(Value::Array(
                tools.into_iter().map(|tool| Value::String(tool.name)).collect(),
            ))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
