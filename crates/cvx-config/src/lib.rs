// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the convert backplane.
//!
//! This crate provides [`ServiceConfig`], the daemon's runtime settings and
//! tool catalogue, together with helpers for loading from TOML files,
//! applying `CVX_*` environment overrides, merging overlays, and producing
//! advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file (or an override) could not be parsed.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A timeout is unusually large.
    LargeTimeout {
        /// `"service"` or the tool name.
        scope: String,
        /// Timeout value in seconds.
        secs: u64,
    },
    /// A spill threshold of zero sends every response through a temp file.
    SpillAlways,
    /// A tool accepts any flag from callers.
    OpenFlagPolicy {
        /// Tool name.
        tool: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeTimeout { scope, secs } => {
                write!(f, "{scope} has a large timeout ({secs}s)")
            }
            ConfigWarning::SpillAlways => {
                f.write_str("spill_threshold_bytes is 0; every response is buffered on disk")
            }
            ConfigWarning::OpenFlagPolicy { tool } => write!(
                f,
                "tool '{tool}' takes {{args}} with no allowed_flags; any flag is accepted"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:8089";

/// Default in-memory output limit before spilling (8 MiB).
pub const DEFAULT_SPILL_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Default response chunk size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default stderr capture bound (1 MiB).
pub const DEFAULT_STDERR_LIMIT: usize = 1024 * 1024;

/// Content type used when a tool declares none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Placeholder replaced by the target format inside an argument token.
pub const FORMAT_PLACEHOLDER: &str = "{format}";

/// Token replaced by the caller's validated extra arguments.
pub const ARGS_PLACEHOLDER: &str = "{args}";

const MIN_CHUNK_SIZE: usize = 1024;
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Maximum allowed timeout in seconds (24 hours).
const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Threshold above which a timeout generates a warning.
const LARGE_TIMEOUT_THRESHOLD: u64 = 3_600;

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the conversion daemon.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Socket address to listen on (e.g. `"0.0.0.0:8089"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Output bytes held in memory per request before spilling to disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spill_threshold_bytes: Option<u64>,

    /// Directory for spill files; the system temp dir when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spill_dir: Option<String>,

    /// Size of each streamed response chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    /// Kill tool processes that run longer than this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Maximum stderr bytes kept for error responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_limit_bytes: Option<usize>,

    /// Allowed CORS origins; `"*"` allows any. No CORS layer when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors_origins: Option<Vec<String>>,

    /// Named conversion tools.
    #[serde(default)]
    pub tools: BTreeMap<String, ToolEntry>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: None,
            log_level: Some("info".into()),
            spill_threshold_bytes: None,
            spill_dir: None,
            chunk_size: None,
            timeout_secs: None,
            stderr_limit_bytes: None,
            cors_origins: None,
            tools: BTreeMap::new(),
        }
    }
}

impl ServiceConfig {
    /// Listen address, falling back to [`DEFAULT_BIND`].
    pub fn bind_addr(&self) -> &str {
        self.bind.as_deref().unwrap_or(DEFAULT_BIND)
    }

    /// Effective log level.
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Effective spill threshold in bytes.
    pub fn spill_threshold(&self) -> u64 {
        self.spill_threshold_bytes.unwrap_or(DEFAULT_SPILL_THRESHOLD)
    }

    /// Effective chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    /// Effective stderr capture bound.
    pub fn stderr_limit(&self) -> usize {
        self.stderr_limit_bytes.unwrap_or(DEFAULT_STDERR_LIMIT)
    }

    /// Service-wide timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Timeout for `tool`: its own override, else the service-wide one.
    pub fn timeout_for(&self, tool: &ToolEntry) -> Option<Duration> {
        tool.timeout_secs
            .map(Duration::from_secs)
            .or_else(|| self.timeout())
    }
}

/// One conversion tool exposed under `/convert/{name}`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ToolEntry {
    /// Executable name (resolved through `PATH`) or absolute path.
    pub program: String,

    /// Argument template. `{format}` inside a token is replaced by the
    /// target format; a token that is exactly `{args}` expands to the
    /// caller's validated extra arguments. Input always arrives on stdin.
    #[serde(default)]
    pub args: Vec<String>,

    /// Accepted target formats. Empty means the tool takes no format.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formats: Vec<String>,

    /// Format used when the request names none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_format: Option<String>,

    /// Response content type when no per-format type applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Flags callers may pass through `x-tool-args` (`-x`, `--name` or `+x`).
    /// Empty allows any flag.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_flags: Vec<String>,

    /// Per-tool timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Free-form description shown by `GET /tools`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Per-format response content types.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub content_types: BTreeMap<String, String>,
}

impl ToolEntry {
    /// Whether the template contains an `{args}` token.
    pub fn takes_args(&self) -> bool {
        self.args.iter().any(|a| a == ARGS_PLACEHOLDER)
    }

    /// Whether the template references `{format}`.
    pub fn takes_format(&self) -> bool {
        self.args.iter().any(|a| a.contains(FORMAT_PLACEHOLDER))
    }

    /// Whether `format` is one of the declared formats.
    pub fn accepts_format(&self, format: &str) -> bool {
        self.formats.iter().any(|f| f == format)
    }

    /// Content type for a response in `format`.
    pub fn content_type_for(&self, format: Option<&str>) -> &str {
        format
            .and_then(|f| self.content_types.get(f))
            .or(self.content_type.as_ref())
            .map(String::as_str)
            .unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`ServiceConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`ServiceConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<ServiceConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => ServiceConfig::default(),
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Parse a TOML string into a [`ServiceConfig`].
pub fn parse_toml(content: &str) -> Result<ServiceConfig, ConfigError> {
    toml::from_str::<ServiceConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides from the process environment.
///
/// Recognised variables:
/// - `CVX_BIND`
/// - `CVX_LOG_LEVEL`
/// - `CVX_SPILL_DIR`
/// - `CVX_TIMEOUT_SECS`
pub fn apply_env_overrides(config: &mut ServiceConfig) -> Result<(), ConfigError> {
    apply_overrides_from(config, |key| std::env::var(key).ok())
}

/// Apply `CVX_*` overrides using `lookup` in place of the process environment.
pub fn apply_overrides_from<F>(config: &mut ServiceConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("CVX_BIND") {
        config.bind = Some(val);
    }
    if let Some(val) = lookup("CVX_LOG_LEVEL") {
        config.log_level = Some(val);
    }
    if let Some(val) = lookup("CVX_SPILL_DIR") {
        config.spill_dir = Some(val);
    }
    if let Some(val) = lookup("CVX_TIMEOUT_SECS") {
        let secs = val.trim().parse::<u64>().map_err(|e| ConfigError::ParseError {
            reason: format!("CVX_TIMEOUT_SECS={val:?}: {e}"),
        })?;
        config.timeout_secs = Some(secs);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (bad bind address, out-of-range sizes or timeouts, malformed
/// tool templates) are returned as a [`ConfigError::ValidationError`]; soft
/// issues come back as warnings.
pub fn validate_config(config: &ServiceConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(level) = &config.log_level {
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            errors.push(format!("invalid log_level '{level}'"));
        }
    }

    if config.bind_addr().parse::<SocketAddr>().is_err() {
        errors.push(format!("invalid bind address '{}'", config.bind_addr()));
    }

    let chunk = config.chunk_size();
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk) {
        errors.push(format!(
            "chunk_size {chunk} out of range ({MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE})"
        ));
    }

    if config.spill_threshold_bytes == Some(0) {
        warnings.push(ConfigWarning::SpillAlways);
    }

    match config.timeout_secs {
        Some(t) => check_timeout("service", t, &mut errors, &mut warnings),
        None => warnings.push(ConfigWarning::MissingOptionalField {
            field: "timeout_secs".into(),
            hint: "tool processes may run without a time limit".into(),
        }),
    }

    if config.tools.is_empty() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "tools".into(),
            hint: "no conversion endpoints will be served".into(),
        });
    }

    for (name, tool) in &config.tools {
        validate_tool(name, tool, &mut errors, &mut warnings);
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

fn check_timeout(
    scope: &str,
    secs: u64,
    errors: &mut Vec<String>,
    warnings: &mut Vec<ConfigWarning>,
) {
    if secs == 0 || secs > MAX_TIMEOUT_SECS {
        errors.push(format!(
            "{scope}: timeout {secs}s out of range (1..{MAX_TIMEOUT_SECS})"
        ));
    } else if secs > LARGE_TIMEOUT_THRESHOLD {
        warnings.push(ConfigWarning::LargeTimeout {
            scope: scope.to_string(),
            secs,
        });
    }
}

fn validate_tool(
    name: &str,
    tool: &ToolEntry,
    errors: &mut Vec<String>,
    warnings: &mut Vec<ConfigWarning>,
) {
    let valid_name = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid_name {
        errors.push(format!(
            "tool name '{name}' must be non-empty ASCII letters, digits, '-' or '_'"
        ));
    }

    if tool.program.trim().is_empty() {
        errors.push(format!("tool '{name}': program must not be empty"));
    }
    if tool.program.contains('\0') || tool.args.iter().any(|a| a.contains('\0')) {
        errors.push(format!("tool '{name}': NUL byte in program or args"));
    }

    let args_tokens = tool.args.iter().filter(|a| a.contains(ARGS_PLACEHOLDER));
    let mut lone = 0usize;
    for token in args_tokens {
        if token == ARGS_PLACEHOLDER {
            lone += 1;
        } else {
            errors.push(format!(
                "tool '{name}': '{ARGS_PLACEHOLDER}' must be a whole argument, found '{token}'"
            ));
        }
    }
    if lone > 1 {
        errors.push(format!(
            "tool '{name}': '{ARGS_PLACEHOLDER}' may appear only once"
        ));
    }

    if tool.takes_format() && tool.formats.is_empty() {
        errors.push(format!(
            "tool '{name}': args use '{FORMAT_PLACEHOLDER}' but no formats are declared"
        ));
    }
    if let Some(default) = &tool.default_format {
        if !tool.accepts_format(default) {
            errors.push(format!(
                "tool '{name}': default_format '{default}' is not in formats"
            ));
        }
    }
    for format in tool.content_types.keys() {
        if !tool.accepts_format(format) {
            errors.push(format!(
                "tool '{name}': content_types has undeclared format '{format}'"
            ));
        }
    }
    for format in &tool.formats {
        let safe = !format.is_empty()
            && format
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_.+".contains(c));
        if !safe {
            errors.push(format!("tool '{name}': invalid format name '{format}'"));
        }
    }

    for flag in &tool.allowed_flags {
        if !is_flag_shape(flag) {
            errors.push(format!(
                "tool '{name}': allowed flag '{flag}' must look like -x, --name or +x"
            ));
        }
    }
    if tool.takes_args() && tool.allowed_flags.is_empty() {
        warnings.push(ConfigWarning::OpenFlagPolicy {
            tool: name.to_string(),
        });
    }

    if let Some(t) = tool.timeout_secs {
        check_timeout(&format!("tool '{name}'"), t, errors, warnings);
    }
}

/// `-x`, `--name` or `+x`: the shapes the daemon treats as flags.
fn is_flag_shape(flag: &str) -> bool {
    let mut chars = flag.chars();
    let shaped = match (chars.next(), chars.next()) {
        (Some('-'), Some(c)) => !c.is_ascii_digit() && c != '.',
        (Some('+'), Some(c)) => c.is_ascii_alphabetic(),
        _ => false,
    };
    shaped && !flag.contains('=') && !flag.chars().any(char::is_whitespace)
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations.  Values in `overlay` take precedence over `base`.
///
/// Tool maps are combined; on name collisions the overlay entry wins.
pub fn merge_configs(base: ServiceConfig, overlay: ServiceConfig) -> ServiceConfig {
    let mut tools = base.tools;
    tools.extend(overlay.tools);
    ServiceConfig {
        bind: overlay.bind.or(base.bind),
        log_level: overlay.log_level.or(base.log_level),
        spill_threshold_bytes: overlay.spill_threshold_bytes.or(base.spill_threshold_bytes),
        spill_dir: overlay.spill_dir.or(base.spill_dir),
        chunk_size: overlay.chunk_size.or(base.chunk_size),
        timeout_secs: overlay.timeout_secs.or(base.timeout_secs),
        stderr_limit_bytes: overlay.stderr_limit_bytes.or(base.stderr_limit_bytes),
        cors_origins: overlay.cors_origins.or(base.cors_origins),
        tools,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
