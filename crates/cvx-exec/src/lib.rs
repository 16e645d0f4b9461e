// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod executor;
pub mod output;
pub mod process;
pub mod pump;
pub mod resolve;
pub mod source;
pub mod spec;
pub mod spill;

pub use error::{Channel, ErrorClass, ExecError, ExitInfo, SpecError};
pub use executor::{DEFAULT_CHUNK_SIZE, ExecOptions, ProcessExecutor};
pub use output::OutputProducer;
pub use process::InvocationState;
pub use pump::{DEFAULT_STDERR_LIMIT, PumpPolicy, SMALL_INPUT_LIMIT, StderrCapture};
pub use resolve::{program_exists, resolve_program};
pub use source::ByteSource;
pub use spec::{CommandSpec, CommandSpecBuilder};
pub use spill::{DEFAULT_SPILL_THRESHOLD, SpillBuffer, SpillReader};

/// Outcome of one invocation: a producer on success, an error otherwise.
pub type ExecutionResult = Result<OutputProducer, ExecError>;
