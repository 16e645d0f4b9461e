// SPDX-License-Identifier: MIT OR Apache-2.0
//! Turning request parameters into a validated [`CommandSpec`].
//!
//! Caller-controlled input reaches a tool only as discrete argv tokens. The
//! `x-tool-args` header is split with quote-aware rules similar to a POSIX
//! shell's word splitting, but with no expansion of any kind: `$`, globs,
//! backticks, redirections and `;` are ordinary characters inside a token.

use cvx_config::{ARGS_PLACEHOLDER, FORMAT_PLACEHOLDER, ToolEntry};
use cvx_exec::{CommandSpec, SpecError};
use thiserror::Error;

/// Maximum number of extra argument tokens per request.
pub const MAX_TOOL_ARGS: usize = 64;

/// Maximum length of one extra argument token, in bytes.
pub const MAX_ARG_LEN: usize = 4096;

/// Rejections of request parameters. All map to `400 Bad Request`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    /// A quoted section was never closed.
    #[error("unterminated {quote} quote in tool arguments")]
    UnterminatedQuote {
        /// The quote character.
        quote: char,
    },

    /// The argument string ends with a lone backslash.
    #[error("tool arguments end with a dangling escape")]
    DanglingEscape,

    /// A control character appeared in the arguments.
    #[error("tool arguments contain a control character")]
    ControlChar,

    /// Too many tokens.
    #[error("too many tool arguments (max {max})")]
    TooManyArgs {
        /// Configured maximum.
        max: usize,
    },

    /// One token is too long.
    #[error("tool argument longer than {max} bytes")]
    ArgTooLong {
        /// Configured maximum.
        max: usize,
    },

    /// A flag outside the tool's allowlist.
    #[error("flag '{flag}' is not allowed for this tool")]
    FlagNotAllowed {
        /// The rejected flag name.
        flag: String,
    },

    /// A value that does not follow a flag.
    #[error("argument '{arg}' must follow a flag")]
    PositionalArg {
        /// The stray value.
        arg: String,
    },

    /// A value that could name a file, URL or resource.
    #[error("argument value '{value}' may not contain '/', '\\', ':' or start with '@'")]
    UnsafeValue {
        /// The rejected value.
        value: String,
    },

    /// The tool's template has no `{args}` slot.
    #[error("this tool does not accept extra arguments")]
    ArgsNotAccepted,

    /// The tool needs a target format and none was given.
    #[error("a target format is required (one of: {})", allowed.join(", "))]
    MissingFormat {
        /// Accepted formats.
        allowed: Vec<String>,
    },

    /// The requested format is not one the tool declares.
    #[error("unsupported format '{format}'")]
    UnsupportedFormat {
        /// The requested format.
        format: String,
    },

    /// The assembled command failed validation.
    #[error(transparent)]
    Spec(#[from] SpecError),
}

/// A command ready to run plus what the response needs to know about it.
#[derive(Debug, Clone)]
pub struct ConvertPlan {
    /// The command to execute.
    pub spec: CommandSpec,
    /// Target format, if any.
    pub format: Option<String>,
    /// Content type of a successful response.
    pub content_type: String,
}

/// Split an `x-tool-args` header value into argv tokens.
///
/// Whitespace separates tokens. `'...'` keeps its contents literally,
/// `"..."` allows `\"` and `\\` escapes, and a backslash outside quotes
/// escapes the next character. Empty quotes produce an empty token.
pub fn split_tool_args(raw: &str) -> Result<Vec<String>, ParamError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            if in_token {
                push_token(&mut tokens, std::mem::take(&mut current))?;
                in_token = false;
            }
            continue;
        }
        if c.is_control() {
            return Err(ParamError::ControlChar);
        }
        in_token = true;
        match c {
            '\'' => loop {
                match chars.next() {
                    Some('\'') => break,
                    Some(c) if c.is_control() => return Err(ParamError::ControlChar),
                    Some(c) => current.push(c),
                    None => return Err(ParamError::UnterminatedQuote { quote: '\'' }),
                }
            },
            '"' => loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(e @ ('"' | '\\')) => current.push(e),
                        Some(c) if c.is_control() => return Err(ParamError::ControlChar),
                        Some(other) => {
                            current.push('\\');
                            current.push(other);
                        }
                        None => return Err(ParamError::UnterminatedQuote { quote: '"' }),
                    },
                    Some(c) if c.is_control() => return Err(ParamError::ControlChar),
                    Some(c) => current.push(c),
                    None => return Err(ParamError::UnterminatedQuote { quote: '"' }),
                }
            },
            '\\' => match chars.next() {
                Some(c) if c.is_control() => return Err(ParamError::ControlChar),
                Some(c) => current.push(c),
                None => return Err(ParamError::DanglingEscape),
            },
            c => current.push(c),
        }
    }
    if in_token {
        push_token(&mut tokens, current)?;
    }
    Ok(tokens)
}

fn push_token(tokens: &mut Vec<String>, token: String) -> Result<(), ParamError> {
    if token.len() > MAX_ARG_LEN {
        return Err(ParamError::ArgTooLong { max: MAX_ARG_LEN });
    }
    if tokens.len() == MAX_TOOL_ARGS {
        return Err(ParamError::TooManyArgs { max: MAX_TOOL_ARGS });
    }
    tokens.push(token);
    Ok(())
}

/// Whether `token` is an option rather than a value.
///
/// `-` alone (stdin) and negative numbers are values. `+name` counts as a
/// flag, as some image tools use it to reset an option.
fn flag_name(token: &str) -> Option<&str> {
    let mut chars = token.chars();
    let lead = chars.next()?;
    let next = chars.next()?;
    if lead == '-' && (next.is_ascii_digit() || next == '.') {
        return None;
    }
    if lead == '-' || (lead == '+' && next.is_ascii_alphabetic()) {
        return Some(token.split_once('=').map_or(token, |(name, _)| name));
    }
    None
}

/// Validate caller tokens against the tool's flag policy.
///
/// Flags must be in `allowed` (an empty allowlist accepts any flag). Every
/// value must directly follow a flag, at most one per flag, and may not look
/// like a path, URL or `@file` reference. A `--name=value` flag carries its
/// value inline and takes no following value.
pub fn check_tool_args(tokens: &[String], allowed: &[String]) -> Result<(), ParamError> {
    let mut expects_value = false;
    for token in tokens {
        match flag_name(token) {
            Some(name) => {
                if !allowed.is_empty() && !allowed.iter().any(|a| a == name) {
                    return Err(ParamError::FlagNotAllowed {
                        flag: name.to_string(),
                    });
                }
                match token.split_once('=') {
                    Some((_, inline)) => {
                        check_value(inline)?;
                        expects_value = false;
                    }
                    None => expects_value = true,
                }
            }
            None if expects_value => {
                check_value(token)?;
                expects_value = false;
            }
            None => {
                return Err(ParamError::PositionalArg { arg: token.clone() });
            }
        }
    }
    Ok(())
}

fn check_value(value: &str) -> Result<(), ParamError> {
    if value.starts_with('@') || value.contains(['/', '\\', ':']) {
        return Err(ParamError::UnsafeValue {
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Assemble the command for one request against `tool`.
///
/// `format` falls back to the tool's `default_format`. `raw_args` is the
/// unparsed `x-tool-args` value.
pub fn build_command(
    tool: &ToolEntry,
    format: Option<&str>,
    raw_args: Option<&str>,
) -> Result<ConvertPlan, ParamError> {
    let format = format
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .or(tool.default_format.as_deref());

    if let Some(f) = format {
        if !tool.accepts_format(f) {
            return Err(ParamError::UnsupportedFormat {
                format: f.to_string(),
            });
        }
    } else if tool.takes_format() {
        return Err(ParamError::MissingFormat {
            allowed: tool.formats.clone(),
        });
    }

    let extra = match raw_args {
        Some(raw) => split_tool_args(raw)?,
        None => Vec::new(),
    };
    if !extra.is_empty() && !tool.takes_args() {
        return Err(ParamError::ArgsNotAccepted);
    }
    check_tool_args(&extra, &tool.allowed_flags)?;

    let mut argv = Vec::with_capacity(tool.args.len() + extra.len());
    for token in &tool.args {
        if token == ARGS_PLACEHOLDER {
            argv.extend(extra.iter().cloned());
        } else if let Some(f) = format {
            argv.push(token.replace(FORMAT_PLACEHOLDER, f));
        } else {
            argv.push(token.clone());
        }
    }

    let spec = CommandSpec::builder(tool.program.as_str()).args(argv).build()?;
    Ok(ConvertPlan {
        spec,
        format: format.map(str::to_string),
        content_type: tool.content_type_for(format).to_string(),
    })
}
