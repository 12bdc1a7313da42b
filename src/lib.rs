#![forbid(unsafe_code)]

//! `pr-scribe` — a client for subprocess-hosted tool servers.
//!
//! Spawns a tool server (such as `github-mcp-server stdio`), speaks
//! newline-delimited JSON-RPC over its stdio, and exposes one call contract:
//! [`ToolClient::invoke`].

pub mod client;
pub mod config;
pub mod errors;
pub mod invoker;
pub mod rpc;

pub use client::{SessionState, ToolClient};
pub use config::ClientConfig;
pub use errors::{AppError, Result};
pub use invoker::ToolInvoker;
