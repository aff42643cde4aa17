//! Directional byte channels and the external process contract.
//!
//! The pipeline core never knows how its channels are sourced: a subprocess
//! pipe, an in-memory buffer in tests, or a socket all satisfy the same
//! blocking `Read` / `Write` contract. Backpressure is whatever the channel
//! itself provides — a blocking read waits for the producer, a blocking write
//! waits for the consumer to drain.

use std::io::{Read, Write};

use crate::error::Result;
use crate::types::ProcessExit;

/// Upstream byte channel carrying raw frames (e.g. decoder stdout).
pub trait ReadableChannel: Read + Send + 'static {}

impl<T: Read + Send + 'static> ReadableChannel for T {}

/// Downstream byte channel carrying raw frames (e.g. encoder stdin).
///
/// Dropping the channel closes its write side.
pub trait WritableChannel: Write + Send + 'static {}

impl<T: Write + Send + 'static> WritableChannel for T {}

/// An independently scheduled external process at one end of a channel.
pub trait ExternalProcess: Send + 'static {
    /// Short role name for logs and reports (`decoder`, `encoder`).
    fn name(&self) -> &str;

    /// Block until the process terminates.
    fn wait(&mut self) -> Result<ProcessExit>;

    /// Best-effort termination. Unblocks any read or write stalled on the
    /// process's pipes.
    fn kill(&mut self) -> Result<()>;
}
