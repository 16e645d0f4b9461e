// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the conversion daemon.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use std::time::Instant;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders};
use tracing::info;
use uuid::Uuid;

use crate::response::{ERROR_CLASS_HEADER, EXIT_CODE_HEADER};

/// Header carrying the request identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

// ---------------------------------------------------------------------------
// RequestId middleware
// ---------------------------------------------------------------------------

/// The request identifier, available as an Axum extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

/// Axum middleware that tags each request with a [`RequestId`].
///
/// A well-formed incoming `x-request-id` is kept so ids propagate across
/// services; otherwise a fresh UUID is generated. The id is echoed on the
/// response.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| is_acceptable_id(v))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

fn is_acceptable_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.:".contains(c))
}

// ---------------------------------------------------------------------------
// RequestLogger
// ---------------------------------------------------------------------------

/// Axum middleware that logs method, path, status code, and duration for each
/// request using [`tracing`] structured fields.
///
/// For streamed conversions the duration covers the tool run, not the time
/// to send the body.
pub struct RequestLogger;

impl RequestLogger {
    /// Axum-compatible handler function.
    pub async fn layer(req: Request, next: Next) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_default();
        let start = Instant::now();

        let resp = next.run(req).await;

        let duration = start.elapsed();
        let status = resp.status().as_u16();

        info!(
            target: "cvx.http",
            method = %method,
            path = %path,
            status,
            duration_ms = duration.as_millis() as u64,
            request_id = %request_id,
            "request completed"
        );

        resp
    }
}

// ---------------------------------------------------------------------------
// CorsConfig
// ---------------------------------------------------------------------------

/// Configuration for CORS headers.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Allowed origins; a lone `"*"` allows any.
    pub allowed_origins: Vec<String>,
    /// Allowed methods.
    pub allowed_methods: Vec<String>,
    /// Allowed request headers.
    pub allowed_headers: Vec<String>,
}

impl CorsConfig {
    /// CORS settings for the conversion endpoints and `origins`.
    pub fn for_origins(origins: &[String]) -> Self {
        Self {
            allowed_origins: origins.to_vec(),
            allowed_methods: vec!["GET".into(), "POST".into()],
            allowed_headers: vec![
                "authorization".into(),
                "content-type".into(),
                "x-source-url".into(),
                "x-target-format".into(),
                "x-tool-args".into(),
                REQUEST_ID_HEADER.into(),
            ],
        }
    }

    /// Convert this configuration into a [`tower_http::cors::CorsLayer`].
    pub fn to_cors_layer(&self) -> CorsLayer {
        let origin = if self.allowed_origins.iter().any(|o| o == "*") {
            AllowOrigin::any()
        } else {
            let origins: Vec<HeaderValue> = self
                .allowed_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok())
                .collect();
            AllowOrigin::list(origins)
        };

        let methods: Vec<axum::http::Method> = self
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();

        let headers: Vec<axum::http::HeaderName> = self
            .allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();

        let exposed: Vec<axum::http::HeaderName> = [REQUEST_ID_HEADER, EXIT_CODE_HEADER, ERROR_CLASS_HEADER]
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(AllowMethods::list(methods))
            .allow_headers(AllowHeaders::list(headers))
            .expose_headers(ExposeHeaders::list(exposed))
    }
}
