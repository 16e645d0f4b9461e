// SPDX-License-Identifier: MIT OR Apache-2.0
//! Execution results as HTTP responses.

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use cvx_config::DEFAULT_CONTENT_TYPE;
use cvx_exec::{ExecError, OutputProducer};

/// Exit code of a failed tool, when it exited with one.
pub const EXIT_CODE_HEADER: &str = "x-exit-code";

/// Broad error class of a failed invocation.
pub const ERROR_CLASS_HEADER: &str = "x-error-class";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// `200 OK` whose body is the producer's output, one frame per chunk.
///
/// The length is known from the spill buffer, so `content-length` is set and
/// the body is never materialised as one value.
pub fn output_response(producer: OutputProducer, content_type: &str) -> Response {
    let len = producer.len();
    let content_type = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

    let mut resp = Response::new(Body::from_stream(producer.into_stream()));
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    resp
}

/// Error response carrying the tool's stderr (or a message) verbatim.
///
/// Status is the error's own suggestion: 500, or 504 for a timeout.
pub fn error_response(err: &ExecError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut resp = (status, err.error_text().into_owned()).into_response();
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
    if let Some(code) = err.exit().and_then(|e| e.code) {
        headers.insert(EXIT_CODE_HEADER, HeaderValue::from(code));
    }
    if let Ok(class) = HeaderValue::from_str(&err.class().to_string()) {
        headers.insert(ERROR_CLASS_HEADER, class);
    }
    resp
}
