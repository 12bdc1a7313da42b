//! NDJSON line framer for tool-server streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length. Lines the framer cannot deliver (too long, or not UTF-8) come out
//! as ordinary [`Frame`] items rather than errors, so a `FramedRead` never
//! enters its error state and keeps decoding what is already buffered. Only
//! genuine I/O failures are errors.
//!
//! # Usage
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//! use pr_scribe::rpc::codec::{frame_lines, Frame};
//!
//! let mut frames = frame_lines(child_stdout, 1_048_576);
//! while let Some(Ok(Frame::Line(line))) = frames.next().await { /* … */ }
//! ```

use std::io::ErrorKind;

use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default maximum inbound line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded unit of a line-oriented stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, without its terminator.
    Line(String),
    /// A line longer than the limit (in bytes) was skipped.
    Oversized(usize),
    /// A complete line that was not valid UTF-8 was skipped.
    NotUtf8,
}

impl Frame {
    /// The line text, if this frame carries one.
    #[must_use]
    pub fn as_line(&self) -> Option<&str> {
        match self {
            Self::Line(line) => Some(line),
            Self::Oversized(_) | Self::NotUtf8 => None,
        }
    }
}

/// Line codec for bidirectional tool-server streams.
///
/// # Decoder
///
/// Yields each `\n`-terminated line without its terminator (a trailing
/// `\r` is stripped too). A fragment with no terminator stays buffered until
/// the rest arrives. A line longer than the limit yields
/// [`Frame::Oversized`] as soon as it is detected; the codec then discards
/// input up to the next `\n` and resumes. A line that is not UTF-8 yields
/// [`Frame::NotUtf8`] and is consumed.
///
/// # Encoder
///
/// Writes `item\n`. The limit is not enforced on the way out.
#[derive(Debug)]
pub struct LineCodec {
    inner: LinesCodec,
    max_length: usize,
}

impl LineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom per-line limit in bytes.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    /// The configured per-line limit in bytes.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn skip_or_fail(&self, e: LinesCodecError) -> Result<Option<Frame>> {
        match e {
            LinesCodecError::MaxLineLengthExceeded => Ok(Some(Frame::Oversized(self.max_length))),
            // `LinesCodec` consumes the line before validating it.
            LinesCodecError::Io(io_err) if io_err.kind() == ErrorKind::InvalidData => {
                Ok(Some(Frame::NotUtf8))
            }
            LinesCodecError::Io(io_err) => Err(AppError::Io(io_err.to_string())),
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.inner.decode(src) {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(e) => self.skip_or_fail(e),
        }
    }

    /// Flush a final unterminated line when the stream reaches EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.inner.decode_eof(src) {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(e) => self.skip_or_fail(e),
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.inner.encode(item, dst).map_err(|e| match e {
            LinesCodecError::MaxLineLengthExceeded => AppError::StreamTooLong(self.max_length),
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
        })
    }
}

/// Frame `reader` into a stream of [`Frame`]s.
///
/// This is the subscription side of the framer: poll the returned stream
/// and every item is one whole line (or one skipped line), in arrival order.
pub fn frame_lines<R>(reader: R, max_line_bytes: usize) -> FramedRead<R, LineCodec>
where
    R: AsyncRead,
{
    FramedRead::new(reader, LineCodec::with_max_length(max_line_bytes))
}
