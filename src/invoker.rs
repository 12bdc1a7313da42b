//! Host-flow seam for tool invocation.
//!
//! The orchestration layer (prompt building, README generation, comment
//! posting) depends on [`ToolInvoker`] rather than on [`ToolClient`]
//! directly, so it can be driven by a scripted invoker in tests or swapped
//! for a command-line fallback when the tool server fails.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::client::ToolClient;
use crate::Result;

/// Invoke named tools and shut the backing resource down.
pub trait ToolInvoker: Send + Sync {
    /// Invoke `tool` with `arguments`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Tool`](crate::AppError::Tool) carrying the tool
    /// name, arguments, and cause, so the caller can choose a fallback.
    fn invoke<'a>(
        &'a self,
        tool: &'a str,
        arguments: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;

    /// Release the backing resource. Idempotent.
    ///
    /// # Errors
    ///
    /// Implementation-specific teardown failures.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

impl ToolInvoker for ToolClient {
    fn invoke<'a>(
        &'a self,
        tool: &'a str,
        arguments: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(ToolClient::invoke(self, tool, arguments))
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(ToolClient::shutdown(self))
    }
}
