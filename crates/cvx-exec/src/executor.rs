// SPDX-License-Identifier: MIT OR Apache-2.0
//! One-shot process execution.

use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ExecError;
use crate::output::OutputProducer;
use crate::process::{InvocationState, ProcessHandle};
use crate::pump::{DEFAULT_STDERR_LIMIT, PumpPolicy, StderrCapture, StreamPump};
use crate::resolve::resolve_program;
use crate::source::ByteSource;
use crate::spec::CommandSpec;
use crate::spill::{DEFAULT_SPILL_THRESHOLD, SpillBuffer};

/// Default size of chunks read from stdout and emitted by the producer.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Tunables for a [`ProcessExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOptions {
    /// Kill the child if it runs longer than this. `None` means unbounded.
    pub timeout: Option<Duration>,
    /// Output bytes kept in memory before spilling to disk.
    pub spill_threshold: usize,
    /// Directory for spill files; system temp dir when `None`.
    pub spill_dir: Option<PathBuf>,
    /// Read and emit chunk size.
    pub chunk_size: usize,
    /// Maximum stderr bytes kept for error reporting.
    pub stderr_limit: usize,
    /// Requested pump policy (may be downgraded per input).
    pub policy: PumpPolicy,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            spill_dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            stderr_limit: DEFAULT_STDERR_LIMIT,
            policy: PumpPolicy::default(),
        }
    }
}

/// Runs one [`CommandSpec`] per call and hands back its output.
///
/// The executor holds no per-invocation state and is cheap to clone; every
/// call gets its own process, pipes, and spill buffer.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    options: ExecOptions,
}

impl ProcessExecutor {
    /// Create an executor with the given options.
    pub fn new(options: ExecOptions) -> Self {
        Self { options }
    }

    /// Active options.
    pub fn options(&self) -> &ExecOptions {
        &self.options
    }

    /// A copy of this executor with a different timeout.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        let mut options = self.options.clone();
        options.timeout = timeout;
        Self { options }
    }

    /// Run `spec`, feeding it `input` when present.
    ///
    /// On success the child has exited zero, its stdout sits in a spill
    /// buffer, and the returned producer replays it. On any failure the
    /// child has been reaped and all pipes are closed before this returns.
    ///
    /// # Errors
    ///
    /// * [`ExecError::NotFound`] before anything is spawned.
    /// * [`ExecError::Spawn`] if the OS refuses to start the program.
    /// * [`ExecError::Failed`] for a non-zero exit, carrying stderr.
    /// * [`ExecError::Stream`] / [`ExecError::Spill`] for broken I/O.
    /// * [`ExecError::Timeout`] when [`ExecOptions::timeout`] expires.
    pub async fn execute(
        &self,
        spec: &CommandSpec,
        input: Option<ByteSource>,
    ) -> Result<OutputProducer, ExecError> {
        let opts = &self.options;
        let program = spec.program();

        let search_path = spec.env().get("PATH").map(OsStr::new);
        let resolved =
            resolve_program(program, search_path).ok_or_else(|| ExecError::NotFound {
                program: program.to_string(),
            })?;

        let policy = opts.policy.effective(input.as_ref());
        let started = Instant::now();
        let mut handle = ProcessHandle::spawn(spec, &resolved)?;
        info!(
            target: "cvx.exec",
            command = %spec,
            pid = ?handle.pid(),
            ?policy,
            input_len = ?input.as_ref().and_then(ByteSource::len_hint),
            "spawned"
        );

        let mut spill = SpillBuffer::new(opts.spill_threshold);
        if let Some(dir) = &opts.spill_dir {
            spill = spill.with_dir(dir);
        }
        let mut stderr = StderrCapture::new(opts.stderr_limit);

        let pump = StreamPump::new(policy, opts.chunk_size, &mut spill, &mut stderr);
        let outcome = match opts.timeout {
            Some(limit) => {
                let timed = tokio::time::timeout(limit, pump.run(&mut handle, input)).await;
                let Ok(outcome) = timed else {
                    handle.close().await;
                    warn!(
                        target: "cvx.exec",
                        program,
                        timeout_ms = limit.as_millis() as u64,
                        "killed after timeout"
                    );
                    return Err(ExecError::Timeout {
                        program: program.to_string(),
                        after: limit,
                        stderr: stderr.text(),
                    });
                };
                outcome
            }
            None => pump.run(&mut handle, input).await,
        };

        let exit = match outcome {
            Ok(exit) => exit,
            Err(err) => {
                handle.close().await;
                let err = err.into_exec(program, stderr.text());
                warn!(target: "cvx.exec", program, error = %err, "pump failed");
                return Err(err);
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if !exit.success() {
            handle.advance(InvocationState::Failed);
            handle.close().await;
            debug!(target: "cvx.exec", program, %exit, elapsed_ms, "process failed");
            return Err(ExecError::Failed {
                program: program.to_string(),
                exit,
                stderr: stderr.text(),
            });
        }

        handle.advance(InvocationState::Succeeded);
        let len = spill.len();
        let reader = match spill.into_reader().await {
            Ok(reader) => reader,
            Err(err) => {
                handle.close().await;
                return Err(ExecError::Spill(err));
            }
        };
        debug!(target: "cvx.exec", program, output_len = len, elapsed_ms, "process succeeded");
        Ok(OutputProducer::new(handle, reader, opts.chunk_size, exit))
    }
}
