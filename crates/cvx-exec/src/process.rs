// SPDX-License-Identifier: MIT OR Apache-2.0
//! Owned process handle: the child plus its three pipes behind one teardown.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, trace};

use crate::error::{ExecError, ExitInfo};
use crate::spec::CommandSpec;

/// Lifecycle of a single invocation.
///
/// `Created → Running → Succeeded → Drained → Closed` on success,
/// `Created → Running → Failed → Closed` otherwise. No state is re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    /// Spec accepted, nothing spawned yet.
    Created,
    /// Child spawned; pipes being pumped.
    Running,
    /// Child exited zero; output waiting to be emitted.
    Succeeded,
    /// Every output byte has been handed to the consumer.
    Drained,
    /// Child exited non-zero, timed out, or a pipe broke.
    Failed,
    /// Pipes released and child reaped.
    Closed,
}

impl InvocationState {
    /// Whether moving from `self` to `next` follows the lifecycle.
    ///
    /// `Succeeded → Closed` covers a producer dropped before it was drained.
    pub fn can_advance_to(self, next: InvocationState) -> bool {
        use InvocationState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Drained)
                | (Succeeded, Closed)
                | (Drained, Closed)
                | (Failed, Closed)
        )
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Drained => "drained",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Pipes detached from a [`ProcessHandle`] for pumping.
#[derive(Debug)]
pub(crate) struct Pipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// A spawned child and its stdio, owned by exactly one invocation.
///
/// [`close`](Self::close) is the single teardown path. If the handle is
/// dropped without it, `kill_on_drop` kills the child and the runtime reaps
/// it in the background.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    program: String,
    child: Child,
    pipes: Option<Pipes>,
    pid: Option<u32>,
    exit: Option<ExitInfo>,
    state: InvocationState,
}

impl ProcessHandle {
    /// Spawn `resolved` with the arguments and environment of `spec`.
    pub fn spawn(spec: &CommandSpec, resolved: &Path) -> Result<Self, ExecError> {
        let mut cmd = Command::new(resolved);
        cmd.args(spec.args())
            .envs(spec.env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = spec.cwd() {
            cmd.current_dir(cwd);
        }

        let spawn_err = |source: io::Error| ExecError::Spawn {
            program: spec.program().to_string(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id();

        let pipes = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => Pipes {
                stdin,
                stdout,
                stderr,
            },
            _ => {
                let _ = child.start_kill();
                return Err(spawn_err(io::Error::other("stdio pipes unavailable")));
            }
        };

        let mut handle = Self {
            program: spec.program().to_string(),
            child,
            pipes: Some(pipes),
            pid,
            exit: None,
            state: InvocationState::Created,
        };
        handle.advance(InvocationState::Running);
        Ok(handle)
    }

    /// OS process id while the child is alive.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InvocationState {
        self.state
    }

    /// Exit status, once observed.
    #[cfg(test)]
    pub fn exit(&self) -> Option<ExitInfo> {
        self.exit
    }

    /// Detach the pipes. Returns `None` after the first call.
    pub fn take_pipes(&mut self) -> Option<Pipes> {
        self.pipes.take()
    }

    /// Record a lifecycle transition.
    pub fn advance(&mut self, next: InvocationState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        trace!(
            target: "cvx.exec",
            program = %self.program,
            pid = ?self.pid,
            from = %self.state,
            to = %next,
            "invocation state"
        );
        self.state = next;
    }

    /// Non-blocking status check.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let exit = self.child.try_wait()?.map(ExitInfo::from_status);
        self.exit = exit;
        Ok(exit)
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> io::Result<ExitInfo> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = ExitInfo::from_status(self.child.wait().await?);
        self.exit = Some(exit);
        Ok(exit)
    }

    /// Release every pipe, kill the child if it is still running, and reap it.
    ///
    /// Idempotent. Always leaves the handle in [`InvocationState::Closed`].
    pub async fn close(&mut self) {
        if self.state == InvocationState::Closed {
            return;
        }
        self.pipes = None;

        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.exit = Some(ExitInfo::from_status(status)),
                _ => {
                    if let Err(err) = self.child.start_kill() {
                        debug!(target: "cvx.exec", program = %self.program, error = %err, "kill failed");
                    }
                    match self.child.wait().await {
                        Ok(status) => self.exit = Some(ExitInfo::from_status(status)),
                        Err(err) => {
                            debug!(target: "cvx.exec", program = %self.program, error = %err, "reap failed")
                        }
                    }
                }
            }
        }

        if self.state == InvocationState::Running {
            self.advance(InvocationState::Failed);
        }
        self.advance(InvocationState::Closed);
        self.pid = None;
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.state != InvocationState::Closed {
            debug!(
                target: "cvx.exec",
                program = %self.program,
                pid = ?self.pid,
                state = %self.state,
                "process handle dropped before close"
            );
        }
    }
}
