//! Tool-server reader task.
//!
//! Frames the child's stdout into lines with [`frame_lines`] and feeds each
//! line to the session's [`Correlator`]. Lines the framer had to skip
//! (oversized, not UTF-8) are logged; the stream keeps flowing.
//!
//! When stdout reaches EOF or fails, the server is gone: every pending call
//! is rejected so no caller waits for a response that cannot come.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::rpc::codec::{frame_lines, Frame};
use crate::rpc::correlator::Correlator;
use crate::AppError;

/// Reason attached to calls rejected because stdout closed.
pub const STREAM_CLOSED_REASON: &str = "tool server closed its output stream";

/// Reader task — routes stdout lines into `correlator`.
///
/// # Cancellation
///
/// When `cancel` fires the reader exits without rejecting anything; the
/// session's shutdown path owns that.
pub async fn run_reader<R>(
    session_id: String,
    stdout: R,
    max_line_bytes: usize,
    correlator: Arc<Correlator>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = frame_lines(stdout, max_line_bytes);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "rpc reader: cancellation received, stopping");
                return;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(session_id, "rpc reader: EOF detected");
                        correlator.close(STREAM_CLOSED_REASON).await;
                        return;
                    }

                    Some(Ok(Frame::Oversized(max))) => {
                        let err = AppError::StreamTooLong(max);
                        warn!(
                            session_id,
                            error = %err,
                            "rpc reader: discarding oversized line"
                        );
                    }

                    Some(Ok(Frame::NotUtf8)) => {
                        debug!(session_id, "rpc reader: discarding non-UTF-8 line");
                    }

                    Some(Err(e)) => {
                        warn!(session_id, error = %e, "rpc reader: IO error, stopping");
                        correlator
                            .close(&format!("tool server output failed: {e}"))
                            .await;
                        return;
                    }

                    Some(Ok(Frame::Line(line))) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let outcome = correlator.handle_line(&line).await;
                        trace!(session_id, ?outcome, "rpc reader: line handled");
                    }
                }
            }
        }
    }
}
