// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for command construction and execution.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building a [`CommandSpec`](crate::CommandSpec).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    /// The program name is empty or whitespace.
    #[error("program must not be empty")]
    EmptyProgram,

    /// A token contains a NUL byte and cannot be passed to the OS.
    #[error("{field} contains a NUL byte")]
    NulByte {
        /// Which token was rejected.
        field: String,
    },

    /// An environment variable name is empty or contains `=`.
    #[error("invalid environment variable name {key:?}")]
    InvalidEnvKey {
        /// The offending name.
        key: String,
    },
}

/// Broad family an [`ExecError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The executable is missing or cannot be started.
    Configuration,
    /// The process ran and exited unsuccessfully.
    Execution,
    /// A pipe, the input source, or the spill buffer failed mid-transfer.
    Stream,
    /// The process exceeded its time budget and was killed.
    Timeout,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::Execution => "execution",
            Self::Stream => "stream",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Byte channel involved in a stream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// The caller-supplied input source.
    Source,
    /// The child's standard input.
    Stdin,
    /// The child's standard output.
    Stdout,
    /// The child's standard error.
    Stderr,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Source => "source",
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        };
        f.write_str(s)
    }
}

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one (Unix only).
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Extract code and signal from an OS exit status.
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// `true` when the process exited with code zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Errors from [`ProcessExecutor::execute`](crate::ProcessExecutor::execute).
#[derive(Debug, Error)]
pub enum ExecError {
    /// The program could not be resolved on this host.
    #[error("executable not found: {program}")]
    NotFound {
        /// Program as named in the [`CommandSpec`](crate::CommandSpec).
        program: String,
    },

    /// The OS refused to start the program.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program as named in the [`CommandSpec`](crate::CommandSpec).
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The process ran and exited unsuccessfully.
    #[error("{program} failed with {exit}")]
    Failed {
        /// Program as named in the [`CommandSpec`](crate::CommandSpec).
        program: String,
        /// Exit code / signal.
        exit: ExitInfo,
        /// Everything the process wrote to stderr (up to the capture limit).
        stderr: String,
    },

    /// A byte channel failed while data was in flight.
    #[error("{channel} failed while running {program}: {source}")]
    Stream {
        /// Program as named in the [`CommandSpec`](crate::CommandSpec).
        program: String,
        /// Which channel broke.
        channel: Channel,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
        /// Whatever stderr text was captured before the failure.
        stderr: String,
    },

    /// The process outlived its time budget and was killed.
    #[error("{program} timed out after {after:?}")]
    Timeout {
        /// Program as named in the [`CommandSpec`](crate::CommandSpec).
        program: String,
        /// Configured budget.
        after: Duration,
        /// Whatever stderr text was captured before the kill.
        stderr: String,
    },

    /// The spill buffer could not store or replay output.
    #[error("spill buffer I/O failed: {0}")]
    Spill(#[source] std::io::Error),
}

impl ExecError {
    /// The [`ErrorClass`] this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } | Self::Spawn { .. } => ErrorClass::Configuration,
            Self::Failed { .. } => ErrorClass::Execution,
            Self::Stream { .. } | Self::Spill(_) => ErrorClass::Stream,
            Self::Timeout { .. } => ErrorClass::Timeout,
        }
    }

    /// HTTP status the engine suggests for this error.
    ///
    /// Always 500 except for timeouts (504). Callers may remap.
    pub fn status(&self) -> u16 {
        match self {
            Self::Timeout { .. } => 504,
            _ => 500,
        }
    }

    /// Exit information, when the process got far enough to report one.
    pub fn exit(&self) -> Option<ExitInfo> {
        match self {
            Self::Failed { exit, .. } => Some(*exit),
            _ => None,
        }
    }

    /// Text suitable as a response body.
    ///
    /// For a failed process this is the captured stderr, verbatim. Stream
    /// failures use captured stderr when there is any and fall back to the
    /// error message otherwise.
    pub fn error_text(&self) -> Cow<'_, str> {
        match self {
            Self::Failed { stderr, .. } => Cow::Borrowed(stderr),
            Self::Stream { stderr, .. } if !stderr.trim().is_empty() => Cow::Borrowed(stderr),
            other => Cow::Owned(other.to_string()),
        }
    }
}
