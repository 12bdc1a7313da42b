//! Subprocess JSON-RPC plumbing.
//!
//! One [`session::ToolSession`] owns one tool-server process and the tasks
//! that talk to it:
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based line framing.
//! - `envelope`: JSON-RPC request/response shapes.
//! - `correlator`: id allocation, the pending-call table, per-call timeouts.
//! - `reader` / `writer`: stdout → correlator and channel → stdin tasks.
//! - `supervisor`: process spawn, stderr forwarding, termination.
//! - `handshake`: MCP initialize/initialized exchange.

pub mod codec;
pub mod correlator;
pub mod envelope;
pub mod handshake;
pub mod reader;
pub mod session;
pub mod supervisor;
pub mod writer;
