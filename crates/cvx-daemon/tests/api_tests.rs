// SPDX-License-Identifier: MIT OR Apache-2.0
#![cfg(unix)]
//! Router-level tests driving real tools through `build_app`.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use cvx_config::parse_toml;
use cvx_daemon::metrics::MetricsSnapshot;
use cvx_daemon::middleware::REQUEST_ID_HEADER;
use cvx_daemon::response::{ERROR_CLASS_HEADER, EXIT_CODE_HEADER};
use cvx_daemon::{AppState, ToolInfo, build_app};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

const TOOLS: &str = r#"
[tools.sort]
program = "sort"
args = ["{args}"]
allowed_flags = ["-r", "-n"]
description = "line sort"

[tools.fail]
program = "sh"
args = ["-c", "echo 'bad input' >&2; exit 2"]

[tools.upper]
program = "sh"
args = ["-c", "printf '%s:' \"$0\"; tr a-z A-Z", "{format}"]
formats = ["txt", "md"]
default_format = "txt"
content_type = "text/plain"
content_types = { md = "text/markdown" }

[tools.slow]
program = "sleep"
args = ["5"]
timeout_secs = 1

[tools.ghost]
program = "cvx-no-such-tool"
"#;

fn test_state_from(toml: &str) -> Arc<AppState> {
    let config = parse_toml(toml).unwrap();
    Arc::new(AppState::new(config).unwrap())
}

fn test_state() -> Arc<AppState> {
    test_state_from(TOOLS)
}

fn post(uri: &str, body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body))
        .unwrap()
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

// ---------------------------------------------------------------------------
// Service endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_ok() {
    let app = build_app(test_state());
    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "ok");
    assert!(json["time"].is_string());
}

#[tokio::test]
async fn tools_lists_catalogue_in_name_order() {
    let app = build_app(test_state());
    let resp = app
        .oneshot(Request::builder().uri("/tools").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let tools: Vec<ToolInfo> = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["fail", "ghost", "slow", "sort", "upper"]);

    let sort = &tools[3];
    assert!(sort.takes_args);
    assert_eq!(sort.description.as_deref(), Some("line sort"));
    let upper = &tools[4];
    assert_eq!(upper.formats, vec!["txt", "md"]);
    assert_eq!(upper.content_type, "text/plain");
}

#[tokio::test]
async fn request_id_is_echoed_or_generated() {
    let state = test_state();

    let resp = build_app(state.clone())
        .oneshot(
            Request::builder()
                .uri("/health")
                .header(REQUEST_ID_HEADER, "edge-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.headers()[REQUEST_ID_HEADER], "edge-42");

    let resp = build_app(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let generated = resp.headers()[REQUEST_ID_HEADER].to_str().unwrap();
    assert_eq!(generated.len(), 36);
}

#[tokio::test]
async fn cors_preflight_when_origins_configured() {
    let toml = format!("cors_origins = [\"https://viewer.example.org\"]\n{TOOLS}");
    let app = build_app(test_state_from(&toml));
    let resp = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/convert/sort")
                .header(header::ORIGIN, "https://viewer.example.org")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://viewer.example.org"
    );
}

// ---------------------------------------------------------------------------
// POST /convert/{tool}
// ---------------------------------------------------------------------------

#[tokio::test]
async fn post_streams_body_through_sort() {
    let app = build_app(test_state());
    let resp = app
        .oneshot(post("/convert/sort", "pear\napple\nbanana\n"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/octet-stream");
    assert_eq!(resp.headers()[header::CONTENT_LENGTH], "18");
    assert_eq!(body_bytes(resp).await, b"apple\nbanana\npear\n");
}

#[tokio::test]
async fn allowed_flag_reaches_the_tool() {
    let app = build_app(test_state());
    let mut req = post("/convert/sort", "pear\napple\nbanana\n");
    req.headers_mut()
        .insert("x-tool-args", "-r".parse().unwrap());
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, b"pear\nbanana\napple\n");
}

#[tokio::test]
async fn disallowed_flag_is_400() {
    let app = build_app(test_state());
    let mut req = post("/convert/sort", "b\na\n");
    req.headers_mut()
        .insert("x-tool-args", "-o /tmp/cvx-out".parse().unwrap());
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert!(json["error"].as_str().unwrap().contains("'-o'"));
}

#[tokio::test]
async fn file_arguments_are_400() {
    let state = test_state();
    for args in ["/etc/passwd", "-r /etc/passwd", "-n @list"] {
        let mut req = post("/convert/sort", "b\na\n");
        req.headers_mut()
            .insert("x-tool-args", args.parse().unwrap());
        let resp = build_app(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{args}");
    }
    assert_eq!(state.metrics.snapshot().invocations, 0);
}

#[tokio::test]
async fn failing_tool_returns_stderr_verbatim() {
    let app = build_app(test_state());
    let resp = app.oneshot(post("/convert/fail", "ignored")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers()[EXIT_CODE_HEADER], "2");
    assert_eq!(resp.headers()[ERROR_CLASS_HEADER], "execution");
    assert_eq!(body_bytes(resp).await, b"bad input\n");
}

#[tokio::test]
async fn format_from_query_selects_content_type() {
    let app = build_app(test_state());
    let resp = app
        .oneshot(post("/convert/upper?format=md", "hello"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/markdown");
    assert_eq!(body_bytes(resp).await, b"md:HELLO");
}

#[tokio::test]
async fn format_from_header_and_default() {
    let state = test_state();

    let mut req = post("/convert/upper", "abc");
    req.headers_mut()
        .insert("x-target-format", "md".parse().unwrap());
    let resp = build_app(state.clone()).oneshot(req).await.unwrap();
    assert_eq!(body_bytes(resp).await, b"md:ABC");

    let resp = build_app(state)
        .oneshot(post("/convert/upper", "abc"))
        .await
        .unwrap();
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain");
    assert_eq!(body_bytes(resp).await, b"txt:ABC");
}

#[tokio::test]
async fn undeclared_format_is_400() {
    let app = build_app(test_state());
    let resp = app
        .oneshot(post("/convert/upper?format=pdf", "abc"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["error"], "unsupported format 'pdf'");
}

#[tokio::test]
async fn unknown_tool_is_404() {
    let app = build_app(test_state());
    let resp = app.oneshot(post("/convert/nope", "x")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let json = body_json(resp).await;
    assert_eq!(json["error"], "unknown tool 'nope'");
}

#[tokio::test]
async fn missing_program_is_configuration_error() {
    let app = build_app(test_state());
    let resp = app.oneshot(post("/convert/ghost", "x")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers()[ERROR_CLASS_HEADER], "configuration");
    assert_eq!(
        body_bytes(resp).await,
        b"executable not found: cvx-no-such-tool"
    );
}

#[tokio::test]
async fn per_tool_timeout_is_504() {
    let app = build_app(test_state());
    let started = std::time::Instant::now();
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/convert/slow")
                .header(header::CONTENT_LENGTH, "0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(resp.headers()[ERROR_CLASS_HEADER], "timeout");
    assert!(started.elapsed() < std::time::Duration::from_secs(4));
}

#[tokio::test]
async fn metrics_count_outcomes() {
    let state = test_state();

    let resp = build_app(state.clone())
        .oneshot(post("/convert/sort", "b\na\n"))
        .await
        .unwrap();
    assert_eq!(body_bytes(resp).await, b"a\nb\n");
    let _ = build_app(state.clone())
        .oneshot(post("/convert/fail", ""))
        .await
        .unwrap();
    // Rejected before spawning; not an invocation.
    let _ = build_app(state.clone())
        .oneshot(post("/convert/upper?format=pdf", ""))
        .await
        .unwrap();

    let resp = build_app(state)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let snap: MetricsSnapshot = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(snap.invocations, 2);
    assert_eq!(snap.succeeded, 1);
    assert_eq!(snap.failed, 1);
    assert_eq!(snap.timed_out, 0);
    assert_eq!(snap.in_flight, 0);
    assert_eq!(snap.bytes_streamed, 4);
}

#[tokio::test]
async fn concurrent_requests_do_not_interfere() {
    let state = test_state();
    let ok = build_app(state.clone()).oneshot(post("/convert/sort", "z\ny\nx\n"));
    let bad = build_app(state).oneshot(post("/convert/fail", "x"));
    let (ok, bad) = tokio::join!(ok, bad);
    let (ok, bad) = (ok.unwrap(), bad.unwrap());

    assert_eq!(bad.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(body_bytes(ok).await, b"x\ny\nz\n");
}

// ---------------------------------------------------------------------------
// GET /convert/{tool}
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_without_source_url_is_400() {
    let app = build_app(test_state());
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/convert/sort")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["error"], "missing x-source-url header");
}

#[tokio::test]
async fn get_with_non_http_source_is_400() {
    let app = build_app(test_state());
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/convert/sort")
                .header("x-source-url", "file:///etc/hosts")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
