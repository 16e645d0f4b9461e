// SPDX-License-Identifier: MIT OR Apache-2.0
#![cfg(unix)]
//! `GET /convert/{tool}` against a mock upstream.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use cvx_config::parse_toml;
use cvx_daemon::upstream::{HttpFetcher, UpstreamFetcher};
use cvx_daemon::{AppState, build_app};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{header as header_eq, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOOLS: &str = r#"
[tools.sort]
program = "sort"

[tools.wc]
program = "wc"
args = ["-c"]
content_type = "text/plain"
"#;

fn test_state() -> Arc<AppState> {
    Arc::new(AppState::new(parse_toml(TOOLS).unwrap()).unwrap())
}

fn get(uri: &str, source: &str) -> axum::http::request::Builder {
    Request::builder().uri(uri).header("x-source-url", source)
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

#[tokio::test]
async fn fetched_source_is_converted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/objects/fruit"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pear\napple\n".to_vec()))
        .mount(&server)
        .await;

    let app = build_app(test_state());
    let resp = app
        .oneshot(
            get("/convert/sort", &format!("{}/objects/fruit", server.uri()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, b"apple\npear\n");
}

#[tokio::test]
async fn bearer_token_is_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/private"))
        .and(header_eq("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"12345".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let app = build_app(test_state());
    let resp = app
        .oneshot(
            get("/convert/wc", &format!("{}/private", server.uri()))
                .header(header::AUTHORIZATION, "Bearer s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain");
    let out = String::from_utf8(body_bytes(resp).await).unwrap();
    assert_eq!(out.trim(), "5");
}

#[tokio::test]
async fn upstream_status_is_propagated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/forbidden"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let app = build_app(test_state());
    let resp = app
        .oneshot(
            get("/convert/sort", &format!("{}/forbidden", server.uri()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let json: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(json["error"], "upstream returned 403");
}

#[tokio::test]
async fn unreachable_upstream_is_502() {
    // Bind then drop to get a port nothing listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let app = build_app(test_state());
    let resp = app
        .oneshot(
            get("/convert/sort", &format!("http://127.0.0.1:{port}/gone"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn fetcher_reports_length_and_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/doc"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![7u8; 4096])
                .insert_header("content-type", "application/pdf"),
        )
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let mut resp = fetcher
        .fetch(&format!("{}/doc", server.uri()), None)
        .await
        .unwrap();
    assert!(resp.is_success());
    assert_eq!(resp.content_type.as_deref(), Some("application/pdf"));
    assert_eq!(resp.body.len_hint(), Some(4096));
    assert!(!resp.body.is_in_memory());

    let mut total = 0;
    while let Some(chunk) = resp.body.next_chunk().await {
        total += chunk.unwrap().len();
    }
    assert_eq!(total, 4096);
}
