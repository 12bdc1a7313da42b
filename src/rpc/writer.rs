//! Tool-server writer task.
//!
//! Drains serialised envelopes from an [`mpsc`] channel and writes each as one
//! `\n`-terminated line to the child's stdin. The task owns the stdin handle,
//! so the pipe is closed when the task ends.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Writer task — forwards outbound lines to `stdin`.
///
/// Exits cleanly when `cancel` fires or every sender is dropped. Stdin is
/// shut down on exit so the server sees EOF.
///
/// # Errors
///
/// Returns [`AppError::Transport`]`("write failed: …")` if a write fails,
/// typically because the server process has exited.
pub async fn run_writer<W>(
    session_id: String,
    stdin: W,
    mut line_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut stdin = stdin;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "rpc writer: cancellation received, stopping");
                break;
            }

            line = line_rx.recv() => {
                let Some(line) = line else {
                    debug!(session_id, "rpc writer: line channel closed, stopping");
                    break;
                };

                let mut bytes = line.into_bytes();
                bytes.push(b'\n');

                if let Err(e) = write_line(&mut stdin, &bytes).await {
                    warn!(session_id, error = %e, "rpc writer: write to stdin failed");
                    return Err(AppError::Transport(format!("write failed: {e}")));
                }
            }
        }
    }

    if let Err(e) = stdin.shutdown().await {
        debug!(session_id, error = %e, "rpc writer: stdin already closed");
    }

    Ok(())
}

async fn write_line<W>(stdin: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stdin.write_all(bytes).await?;
    stdin.flush().await
}
