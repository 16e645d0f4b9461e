// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]
/// Invocation counters.
pub mod metrics;
/// Middleware stack for the daemon HTTP API.
pub mod middleware;
/// Request parameters to command lines.
pub mod params;
/// Execution results as HTTP responses.
pub mod response;
/// Remote source retrieval.
pub mod upstream;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxPath, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use cvx_config::{ServiceConfig, ToolEntry};
use cvx_exec::{ByteSource, ExecOptions, ProcessExecutor};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::metrics::{ConvertMetrics, MetricsSnapshot};
use crate::middleware::{CorsConfig, RequestLogger, request_id_middleware};
use crate::params::{ConvertPlan, build_command};
use crate::response::{error_response, output_response};
use crate::upstream::{
    DEFAULT_CONNECT_TIMEOUT, HttpFetcher, UpstreamError, UpstreamFetcher, bearer_token,
};

/// Header naming the remote object for `GET /convert/{tool}`.
pub const SOURCE_URL_HEADER: &str = "x-source-url";
/// Header carrying the target format.
pub const TARGET_FORMAT_HEADER: &str = "x-target-format";
/// Header carrying extra tool arguments.
pub const TOOL_ARGS_HEADER: &str = "x-tool-args";

/// Shared application state for the daemon HTTP server.
#[derive(Clone)]
pub struct AppState {
    /// Validated service configuration.
    pub config: Arc<ServiceConfig>,
    /// Executor built from the config's engine settings.
    pub executor: ProcessExecutor,
    /// Retrieves remote sources for `GET` conversions.
    pub fetcher: Arc<dyn UpstreamFetcher>,
    /// Invocation counters.
    pub metrics: Arc<ConvertMetrics>,
}

impl AppState {
    /// State with an HTTP upstream fetcher.
    pub fn new(config: ServiceConfig) -> Result<Self, UpstreamError> {
        let fetcher = HttpFetcher::new(DEFAULT_CONNECT_TIMEOUT)?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    /// State with a caller-supplied fetcher.
    pub fn with_fetcher(config: ServiceConfig, fetcher: Arc<dyn UpstreamFetcher>) -> Self {
        let executor = ProcessExecutor::new(exec_options(&config));
        Self {
            config: Arc::new(config),
            executor,
            fetcher,
            metrics: Arc::new(ConvertMetrics::new()),
        }
    }
}

/// Engine options for `config`. Timeouts are applied per tool.
pub fn exec_options(config: &ServiceConfig) -> ExecOptions {
    ExecOptions {
        timeout: config.timeout(),
        spill_threshold: usize::try_from(config.spill_threshold()).unwrap_or(usize::MAX),
        spill_dir: config.spill_dir.as_ref().map(Into::into),
        chunk_size: config.chunk_size(),
        stderr_limit: config.stderr_limit(),
        ..ExecOptions::default()
    }
}

/// An API error with HTTP status code and message.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status code.
    pub status: StatusCode,
    /// Human-readable error message.
    pub message: String,
}

impl ApiError {
    /// Create a new `ApiError` with the given status and message.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status.as_u16(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<params::ParamError> for ApiError {
    fn from(err: params::ParamError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        let status = match err {
            UpstreamError::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
            UpstreamError::Client(_) | UpstreamError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

/// One entry of `GET /tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Route name under `/convert/`.
    pub name: String,
    /// Configured program.
    pub program: String,
    /// Accepted target formats.
    pub formats: Vec<String>,
    /// Format used when none is requested.
    pub default_format: Option<String>,
    /// Default response content type.
    pub content_type: String,
    /// Whether `x-tool-args` is accepted.
    pub takes_args: bool,
    /// Free-form description.
    pub description: Option<String>,
}

impl ToolInfo {
    fn from_entry(name: &str, tool: &ToolEntry) -> Self {
        Self {
            name: name.to_string(),
            program: tool.program.clone(),
            formats: tool.formats.clone(),
            default_format: tool.default_format.clone(),
            content_type: tool.content_type_for(tool.default_format.as_deref()).to_string(),
            takes_args: tool.takes_args(),
            description: tool.description.clone(),
        }
    }
}

/// Query parameters for `/convert/{tool}`.
#[derive(Debug, Default, Deserialize)]
pub struct ConvertQuery {
    /// Target format; wins over `x-target-format`.
    pub format: Option<String>,
}

/// Build the Axum router with all daemon routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = state
        .config
        .cors_origins
        .as_deref()
        .filter(|origins| !origins.is_empty())
        .map(|origins| CorsConfig::for_origins(origins).to_cors_layer());

    let router = Router::new()
        .route("/health", get(cmd_health))
        .route("/metrics", get(cmd_metrics))
        .route("/tools", get(cmd_tools))
        .route(
            "/convert/{tool}",
            get(cmd_convert_get).post(cmd_convert_post),
        )
        .with_state(state)
        .layer(axum::middleware::from_fn(RequestLogger::layer))
        .layer(axum::middleware::from_fn(request_id_middleware));

    match cors {
        Some(layer) => router.layer(layer),
        None => router,
    }
}

async fn cmd_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "time": Utc::now().to_rfc3339(),
    }))
}

async fn cmd_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn cmd_tools(State(state): State<Arc<AppState>>) -> Json<Vec<ToolInfo>> {
    Json(
        state
            .config
            .tools
            .iter()
            .map(|(name, tool)| ToolInfo::from_entry(name, tool))
            .collect(),
    )
}

async fn cmd_convert_post(
    State(state): State<Arc<AppState>>,
    AxPath(tool_name): AxPath<String>,
    Query(query): Query<ConvertQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let tool = lookup_tool(&state, &tool_name)?;
    let plan = plan_for(tool, &query, &headers)?;

    let input = match content_length(&headers) {
        Some(0) => None,
        len => {
            let stream = body.into_data_stream().map_err(io::Error::other);
            let source = ByteSource::from_stream(stream);
            Some(match len {
                Some(n) => source.with_len(n),
                None => source,
            })
        }
    };

    Ok(run_conversion(&state, &tool_name, tool, plan, input).await)
}

async fn cmd_convert_get(
    State(state): State<Arc<AppState>>,
    AxPath(tool_name): AxPath<String>,
    Query(query): Query<ConvertQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tool = lookup_tool(&state, &tool_name)?;
    let plan = plan_for(tool, &query, &headers)?;

    let url = header_str(&headers, SOURCE_URL_HEADER).ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("missing {SOURCE_URL_HEADER} header"),
        )
    })?;
    let token = header_str(&headers, header::AUTHORIZATION.as_str()).and_then(bearer_token);

    let upstream = state.fetcher.fetch(url, token).await?;
    if !upstream.is_success() {
        warn!(target: "cvx.daemon", tool = %tool_name, status = upstream.status, "upstream refused source");
        let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
        return Err(ApiError::new(
            status,
            format!("upstream returned {}", upstream.status),
        ));
    }
    debug!(
        target: "cvx.daemon",
        tool = %tool_name,
        content_type = ?upstream.content_type,
        len = ?upstream.body.len_hint(),
        "streaming upstream source"
    );

    Ok(run_conversion(&state, &tool_name, tool, plan, Some(upstream.body)).await)
}

fn lookup_tool<'a>(state: &'a AppState, name: &str) -> Result<&'a ToolEntry, ApiError> {
    state
        .config
        .tools
        .get(name)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown tool '{name}'")))
}

fn plan_for(
    tool: &ToolEntry,
    query: &ConvertQuery,
    headers: &HeaderMap,
) -> Result<ConvertPlan, ApiError> {
    let format = query
        .format
        .as_deref()
        .or_else(|| header_str(headers, TARGET_FORMAT_HEADER));
    let raw_args = header_str(headers, TOOL_ARGS_HEADER);
    Ok(build_command(tool, format, raw_args)?)
}

async fn run_conversion(
    state: &AppState,
    tool_name: &str,
    tool: &ToolEntry,
    plan: ConvertPlan,
    input: Option<ByteSource>,
) -> Response {
    let executor = state.executor.with_timeout(state.config.timeout_for(tool));
    let _in_flight = state.metrics.start();

    match executor.execute(&plan.spec, input).await {
        Ok(producer) => {
            state.metrics.record_success(producer.len());
            info!(
                target: "cvx.daemon",
                tool = %tool_name,
                format = ?plan.format,
                bytes = producer.len(),
                "conversion succeeded"
            );
            output_response(producer, &plan.content_type)
        }
        Err(err) => {
            state.metrics.record_failure(&err);
            warn!(
                target: "cvx.daemon",
                tool = %tool_name,
                class = %err.class(),
                error = %err,
                "conversion failed"
            );
            error_response(&err)
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, header::CONTENT_LENGTH.as_str()).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::collections::BTreeMap;

    #[test]
    fn exec_options_follow_config() {
        let cfg = ServiceConfig {
            spill_threshold_bytes: Some(1024),
            chunk_size: Some(4096),
            timeout_secs: Some(9),
            spill_dir: Some("/var/tmp/cvx".into()),
            ..ServiceConfig::default()
        };
        let opts = exec_options(&cfg);
        assert_eq!(opts.spill_threshold, 1024);
        assert_eq!(opts.chunk_size, 4096);
        assert_eq!(opts.timeout, Some(std::time::Duration::from_secs(9)));
        assert_eq!(opts.spill_dir.as_deref(), Some(std::path::Path::new("/var/tmp/cvx")));
    }

    #[test]
    fn query_format_wins_over_header() {
        let tool = ToolEntry {
            program: "convert".into(),
            args: vec!["-".into(), "{format}:-".into()],
            formats: vec!["png".into(), "jpg".into()],
            content_types: BTreeMap::from([("png".into(), "image/png".into())]),
            ..ToolEntry::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert(TARGET_FORMAT_HEADER, HeaderValue::from_static("jpg"));
        let query = ConvertQuery {
            format: Some("png".into()),
        };
        let plan = plan_for(&tool, &query, &headers).unwrap();
        assert_eq!(plan.format.as_deref(), Some("png"));
        assert_eq!(plan.content_type, "image/png");

        let plan = plan_for(&tool, &ConvertQuery::default(), &headers).unwrap();
        assert_eq!(plan.format.as_deref(), Some("jpg"));
    }

    #[test]
    fn upstream_errors_map_to_gateway_statuses() {
        let err: ApiError = UpstreamError::InvalidUrl {
            url: "ftp://x".into(),
            reason: "unsupported scheme 'ftp'".into(),
        }
        .into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn content_length_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(content_length(&headers), Some(42));
    }
}
