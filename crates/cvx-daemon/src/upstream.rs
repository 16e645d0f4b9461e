// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fetching a remote source object for `GET /convert/{tool}`.

use async_trait::async_trait;
use cvx_exec::ByteSource;
use futures::TryStreamExt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default connect timeout for upstream requests.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors reaching the upstream service.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The source locator is not an absolute http(s) URL.
    #[error("invalid source url '{url}': {reason}")]
    InvalidUrl {
        /// The rejected locator.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request failed before a status was received.
    #[error("upstream request failed: {0}")]
    Transport(#[source] reqwest::Error),
}

/// Status, metadata, and streaming body of an upstream response.
#[derive(Debug)]
pub struct UpstreamResponse {
    /// HTTP status returned by the upstream.
    pub status: u16,
    /// Upstream `content-type`, if any.
    pub content_type: Option<String>,
    /// The body, not yet read.
    pub body: ByteSource,
}

impl UpstreamResponse {
    /// `true` for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Retrieves a remote object given its locator and the caller's token.
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    /// Start fetching `url`. The body is streamed, not buffered.
    async fn fetch(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

/// [`UpstreamFetcher`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a fetcher whose connections time out after `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(UpstreamError::Client)?;
        Ok(Self { client })
    }
}

fn parse_source_url(url: &str) -> Result<reqwest::Url, UpstreamError> {
    let invalid = |reason: String| UpstreamError::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let parsed = reqwest::Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(invalid(format!("unsupported scheme '{other}'"))),
    }
}

#[async_trait]
impl UpstreamFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = parse_source_url(url)?;
        let mut req = self.client.get(url.clone());
        if let Some(token) = bearer_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(UpstreamError::Transport)?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let len = resp.content_length();
        debug!(target: "cvx.daemon", %url, status, ?len, "upstream responded");

        let stream = resp.bytes_stream().map_err(io::Error::other);
        let mut body = ByteSource::from_stream(stream);
        if let Some(len) = len {
            body = body.with_len(len);
        }
        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
