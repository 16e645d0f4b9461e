// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pipe pumping without pipe-buffer deadlock.
//!
//! A child that fills its stdout pipe blocks until someone reads it. If the
//! parent is at the same time blocked writing stdin, neither side can move.
//! The pump therefore never writes all input before reading any output:
//! either stdin, stdout, and stderr are serviced as concurrently polled
//! futures ([`PumpPolicy::ConcurrentCopy`]), or a small in-memory input is
//! handed to the kernel in one go and output is drained while polling for
//! exit ([`PumpPolicy::DrainWhileWaiting`]).

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tracing::{debug, trace};

use crate::error::{Channel, ExecError, ExitInfo};
use crate::process::{Pipes, ProcessHandle};
use crate::source::ByteSource;
use crate::spill::SpillBuffer;

/// Largest in-memory input eligible for [`PumpPolicy::DrainWhileWaiting`].
///
/// Well under the smallest common pipe capacity, so writing it never blocks.
pub const SMALL_INPUT_LIMIT: u64 = 16 * 1024;

/// Sleep between status polls in [`PumpPolicy::DrainWhileWaiting`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Default stderr capture bound (1 MiB).
pub const DEFAULT_STDERR_LIMIT: usize = 1024 * 1024;

const STDERR_CHUNK: usize = 8 * 1024;

/// How stdin and stdout are interleaved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpPolicy {
    /// Feed stdin and drain stdout/stderr concurrently until EOF.
    #[default]
    ConcurrentCopy,
    /// Write a small input up front, then drain output while polling for exit.
    DrainWhileWaiting,
}

impl PumpPolicy {
    /// The policy actually used for `source`.
    ///
    /// `DrainWhileWaiting` is only honoured when there is no input or the
    /// input is in memory and at most [`SMALL_INPUT_LIMIT`] bytes; anything
    /// else falls back to `ConcurrentCopy`.
    pub fn effective(self, source: Option<&ByteSource>) -> PumpPolicy {
        match (self, source) {
            (Self::ConcurrentCopy, _) => Self::ConcurrentCopy,
            (Self::DrainWhileWaiting, None) => Self::DrainWhileWaiting,
            (Self::DrainWhileWaiting, Some(src)) => {
                let small = src.is_in_memory()
                    && src.len_hint().is_some_and(|len| len <= SMALL_INPUT_LIMIT);
                if small {
                    Self::DrainWhileWaiting
                } else {
                    Self::ConcurrentCopy
                }
            }
        }
    }
}

/// Bounded capture of a child's stderr.
///
/// Bytes past the limit are counted and discarded; reading continues so the
/// child never blocks on a full stderr pipe.
#[derive(Debug, Clone)]
pub struct StderrCapture {
    limit: usize,
    buf: Vec<u8>,
    dropped: u64,
}

impl StderrCapture {
    /// Capture at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: Vec::new(),
            dropped: 0,
        }
    }

    /// Record a chunk read from stderr.
    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        let keep = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..keep]);
        self.dropped += (chunk.len() - keep) as u64;
    }

    /// Captured bytes, decoded lossily as UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    /// Bytes discarded because the limit was reached.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Failure inside the pump; stderr is attached by the executor.
#[derive(Debug)]
pub(crate) enum PumpError {
    Stream { channel: Channel, source: io::Error },
    Spill(io::Error),
}

impl PumpError {
    fn stream(channel: Channel, source: io::Error) -> Self {
        Self::Stream { channel, source }
    }

    pub fn into_exec(self, program: &str, stderr: String) -> ExecError {
        match self {
            Self::Stream { channel, source } => ExecError::Stream {
                program: program.to_string(),
                channel,
                source,
                stderr,
            },
            Self::Spill(source) => ExecError::Spill(source),
        }
    }
}

/// Moves bytes between a [`ByteSource`], the child, and the output sinks.
#[derive(Debug)]
pub(crate) struct StreamPump<'a> {
    policy: PumpPolicy,
    chunk_size: usize,
    spill: &'a mut SpillBuffer,
    stderr: &'a mut StderrCapture,
}

impl<'a> StreamPump<'a> {
    pub fn new(
        policy: PumpPolicy,
        chunk_size: usize,
        spill: &'a mut SpillBuffer,
        stderr: &'a mut StderrCapture,
    ) -> Self {
        Self {
            policy,
            chunk_size: chunk_size.max(1),
            spill,
            stderr,
        }
    }

    /// Pump until stdout and stderr reach EOF and the child has exited.
    pub async fn run(
        self,
        handle: &mut ProcessHandle,
        source: Option<ByteSource>,
    ) -> Result<ExitInfo, PumpError> {
        let pipes = handle.take_pipes().ok_or_else(|| {
            PumpError::stream(Channel::Stdin, io::Error::other("pipes already taken"))
        })?;
        match self.policy.effective(source.as_ref()) {
            PumpPolicy::ConcurrentCopy => self.concurrent_copy(handle, pipes, source).await,
            PumpPolicy::DrainWhileWaiting => self.drain_while_waiting(handle, pipes, source).await,
        }
    }

    async fn concurrent_copy(
        self,
        handle: &mut ProcessHandle,
        pipes: Pipes,
        source: Option<ByteSource>,
    ) -> Result<ExitInfo, PumpError> {
        let Pipes {
            stdin,
            stdout,
            stderr,
        } = pipes;

        let (written, drained, ()) = tokio::try_join!(
            feed_stdin(stdin, source),
            drain_into_spill(stdout, self.spill, self.chunk_size),
            capture_stderr(stderr, self.stderr),
        )?;
        debug!(target: "cvx.exec", written, drained, "pipes reached EOF");

        handle
            .wait()
            .await
            .map_err(|e| PumpError::stream(Channel::Stdout, e))
    }

    async fn drain_while_waiting(
        self,
        handle: &mut ProcessHandle,
        pipes: Pipes,
        source: Option<ByteSource>,
    ) -> Result<ExitInfo, PumpError> {
        let Pipes {
            stdin,
            mut stdout,
            mut stderr,
        } = pipes;

        // Small enough to sit in the pipe buffer, so this never waits on the child.
        feed_stdin(stdin, source).await?;

        let mut out_buf = vec![0u8; self.chunk_size];
        let mut err_buf = vec![0u8; STDERR_CHUNK];
        let mut stdout_open = true;
        let mut stderr_open = true;

        let exit = loop {
            if let Some(exit) = handle
                .try_wait()
                .map_err(|e| PumpError::stream(Channel::Stdout, e))?
            {
                break exit;
            }
            tokio::select! {
                read = stdout.read(&mut out_buf), if stdout_open => {
                    let n = read.map_err(|e| PumpError::stream(Channel::Stdout, e))?;
                    if n == 0 {
                        stdout_open = false;
                    } else {
                        self.spill.write(&out_buf[..n]).await.map_err(PumpError::Spill)?;
                    }
                }
                read = stderr.read(&mut err_buf), if stderr_open => {
                    let n = read.map_err(|e| PumpError::stream(Channel::Stderr, e))?;
                    if n == 0 {
                        stderr_open = false;
                    } else {
                        self.stderr.push(&err_buf[..n]);
                    }
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        };

        // Trailing bytes written just before exit.
        if stdout_open {
            drain_into_spill(stdout, self.spill, self.chunk_size).await?;
        }
        if stderr_open {
            capture_stderr(stderr, self.stderr).await?;
        }
        Ok(exit)
    }
}

async fn feed_stdin(mut stdin: ChildStdin, source: Option<ByteSource>) -> Result<u64, PumpError> {
    let Some(mut source) = source else {
        return Ok(0);
    };

    let mut written = 0u64;
    while let Some(chunk) = source.next_chunk().await {
        let chunk = chunk.map_err(|e| PumpError::stream(Channel::Source, e))?;
        match stdin.write_all(&chunk).await {
            Ok(()) => written += chunk.len() as u64,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(target: "cvx.exec", written, "child closed stdin early");
                return Ok(written);
            }
            Err(e) => return Err(PumpError::stream(Channel::Stdin, e)),
        }
    }

    match stdin.shutdown().await {
        Ok(()) => Ok(written),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(written),
        Err(e) => Err(PumpError::stream(Channel::Stdin, e)),
    }
}

async fn drain_into_spill<R>(
    mut reader: R,
    spill: &mut SpillBuffer,
    chunk_size: usize,
) -> Result<u64, PumpError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| PumpError::stream(Channel::Stdout, e))?;
        if n == 0 {
            return Ok(total);
        }
        spill.write(&buf[..n]).await.map_err(PumpError::Spill)?;
        total += n as u64;
    }
}

async fn capture_stderr<R>(mut reader: R, capture: &mut StderrCapture) -> Result<(), PumpError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; STDERR_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| PumpError::stream(Channel::Stderr, e))?;
        if n == 0 {
            if capture.dropped() > 0 {
                debug!(target: "cvx.exec.stderr", dropped = capture.dropped(), "stderr truncated");
            }
            return Ok(());
        }
        trace!(target: "cvx.exec.stderr", bytes = n, "stderr chunk");
        capture.push(&buf[..n]);
    }
}
