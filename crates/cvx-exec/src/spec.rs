// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command descriptions: program, argv, environment, working directory.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::SpecError;

/// Immutable description of a program and its argv tokens.
///
/// Every argument is a discrete token handed to the OS as-is; no shell ever
/// sees the command line, so nothing is interpolated into a single string.
/// Build one with [`CommandSpec::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Start building a spec for `program`.
    pub fn builder(program: impl Into<String>) -> CommandSpecBuilder {
        CommandSpecBuilder {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Program path or bare name resolved through `PATH`.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments, excluding the program itself.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Extra environment variables for the child.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Working directory override.
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Full argv: program followed by its arguments.
    pub fn argv(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }
}

/// Renders the argv quoted for log lines. The result is never executed.
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.argv().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write_quoted(f, token)?;
        }
        Ok(())
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, token: &str) -> fmt::Result {
    let plain = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if plain {
        return f.write_str(token);
    }
    f.write_str("'")?;
    for (i, piece) in token.split('\'').enumerate() {
        if i > 0 {
            f.write_str("'\\''")?;
        }
        f.write_str(piece)?;
    }
    f.write_str("'")
}

/// Builder for [`CommandSpec`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct CommandSpecBuilder {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
}

impl CommandSpecBuilder {
    /// Append one argument token.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several argument tokens in order.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run the child in `dir`.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Validate and freeze the command.
    ///
    /// Rejects an empty program and any token containing a NUL byte, which
    /// cannot be represented in an OS argument vector.
    pub fn build(self) -> Result<CommandSpec, SpecError> {
        if self.program.trim().is_empty() {
            return Err(SpecError::EmptyProgram);
        }
        if self.program.contains('\0') {
            return Err(SpecError::NulByte {
                field: "program".into(),
            });
        }
        if let Some(index) = self.args.iter().position(|a| a.contains('\0')) {
            return Err(SpecError::NulByte {
                field: format!("argument {index}"),
            });
        }
        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(SpecError::InvalidEnvKey { key: key.clone() });
            }
            if value.contains('\0') {
                return Err(SpecError::NulByte {
                    field: format!("env {key}"),
                });
            }
        }

        Ok(CommandSpec {
            program: self.program,
            args: self.args,
            env: self.env,
            cwd: self.cwd,
        })
    }
}
