// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Integration tests
//
// End-to-end tests exercising the full proxy pipeline:
// request → injection → initial upstream call → retry engine → response
//
// Uses wiremock as the upstream, tower::ServiceExt::oneshot for in-process
// HTTP, and the real reqwest-backed sender (no mocks except the upstream).

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use restitch::config::Config;
use restitch::inject::{CONTINUATION_DIRECTIVE, DONE_INSTRUCTION};
use restitch::proxy::{build_router, AppState};
use restitch::stream::{DONE_LINE, DONE_TOKEN};
use restitch::upstream::ReqwestHttpSender;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const STREAM_PATH: &str = "/v1beta/models/gem:streamGenerateContent";

// ---------------------------------------------------------------------------
// Infrastructure
// ---------------------------------------------------------------------------

fn test_config(upstream: &str) -> Config {
    Config {
        upstream_base_url: upstream.to_string(),
        max_consecutive_retries: 3,
        retry_delay: Duration::from_millis(1),
        ..Config::default()
    }
}

fn build_app(config: Config) -> axum::Router {
    let state = AppState::new(
        Arc::new(config),
        Arc::new(ReqwestHttpSender::new(reqwest::Client::new())),
        None,
    );
    build_router(state)
}

fn sse_body(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|line| format!("{line}\n\n"))
        .collect::<String>()
}

fn text_line(text: &str) -> String {
    format!(
        "data: {}",
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
    )
}

fn finish_line(text: &str, reason: &str) -> String {
    format!(
        "data: {}",
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] }, "finishReason": reason }] })
    )
}

fn stream_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("{STREAM_PATH}?alt=sse"))
        .header("content-type", "application/json")
        .header("x-goog-api-key", "test-key")
        .body(Body::from(body.to_owned()))
        .unwrap()
}

fn generation_body() -> String {
    json!({ "contents": [{ "role": "user", "parts": [{ "text": "Tell me a story" }] }] })
        .to_string()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn sse_template(lines: &[&str]) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(
        sse_body(lines).into_bytes(),
        "text/event-stream; charset=utf-8",
    )
}

// ---------------------------------------------------------------------------
// Test 1: Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_stream_is_relayed_with_synthesized_done() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(body_string_contains("you must write the token [done]"))
        .respond_with(sse_template(&[
            &text_line("Hello "),
            &finish_line("world", "STOP"),
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let app = build_app(test_config(&server.uri()));
    let response = app.oneshot(stream_request(&generation_body())).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream; charset=utf-8"
    );
    assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );

    let body = body_string(response).await;
    let hello = body.find("Hello ").unwrap();
    let world = body.find("world").unwrap();
    let done = body.find(DONE_LINE).unwrap();
    assert!(hello < world && world < done);
    assert_eq!(body.matches(DONE_LINE).count(), 1);
}

// ---------------------------------------------------------------------------
// Test 2: Dropped stream is continued transparently
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dropped_stream_is_continued_transparently() {
    let server = MockServer::start().await;

    // The continuation request carries the partial text and the fixed
    // directive; mounted first so it wins for retries.
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(body_string_contains(CONTINUATION_DIRECTIVE))
        .and(body_string_contains("The quick "))
        .respond_with(sse_template(&[&finish_line("brown fox.", "STOP")]))
        .expect(1)
        .mount(&server)
        .await;

    // The initial request: partial text, then the body just ends.
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(sse_template(&[&text_line("The quick ")]))
        .expect(1)
        .mount(&server)
        .await;

    let app = build_app(test_config(&server.uri()));
    let response = app.oneshot(stream_request(&generation_body())).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    let first = body.find("The quick ").unwrap();
    let second = body.find("brown fox.").unwrap();
    let done = body.find(DONE_LINE).unwrap();
    assert!(first < second && second < done);
    assert_eq!(body.matches(DONE_LINE).count(), 1);
    assert!(!body.contains("event: error"));
}

// ---------------------------------------------------------------------------
// Test 3: Initial upstream failure is shaped
// ---------------------------------------------------------------------------

#[tokio::test]
async fn initial_429_gains_google_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(json!({ "error": { "code": 429, "message": "quota" } })),
        )
        .mount(&server)
        .await;

    let app = build_app(test_config(&server.uri()));
    let response = app.oneshot(stream_request(&generation_body())).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"]["status"], "RESOURCE_EXHAUSTED");
    assert_eq!(body["error"]["message"], "quota");
}

#[tokio::test]
async fn initial_429_without_json_body_gets_quota_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let app = build_app(test_config(&server.uri()));
    let response = app.oneshot(stream_request(&generation_body())).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(
        body["error"]["message"],
        "Resource has been exhausted (e.g. check quota)."
    );
}

#[tokio::test]
async fn unreachable_upstream_returns_502() {
    // Point at a closed port; no server is listening.
    let app = build_app(test_config("http://127.0.0.1:9"));
    let response = app.oneshot(stream_request(&generation_body())).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"]["message"], "Failed to connect to upstream server");
}

// ---------------------------------------------------------------------------
// Test 4: Retry exhaustion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_retries_surface_an_error_frame() {
    let server = MockServer::start().await;
    // Every attempt returns partial text and then drops.
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(sse_template(&[&text_line("partial ")]))
        .expect(2) // initial + one retry
        .mount(&server)
        .await;

    let mut config = test_config(&server.uri());
    config.max_consecutive_retries = 1;
    let app = build_app(config);
    let response = app.oneshot(stream_request(&generation_body())).await.unwrap();

    // The stream already started, so the failure arrives mid-stream.
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("partial "));
    assert_eq!(body.matches("event: error").count(), 1);
    assert!(body.contains("DEADLINE_EXCEEDED"));
    assert!(body.contains("Retry limit (1) exceeded"));
    assert!(!body.contains(DONE_LINE));
}

// ---------------------------------------------------------------------------
// Test 5: Injection on the wire
// ---------------------------------------------------------------------------

#[tokio::test]
async fn initial_request_carries_the_injected_instruction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(body_string_contains(DONE_INSTRUCTION))
        .respond_with(sse_template(&[&finish_line("ok.", "STOP")]))
        .expect(1)
        .mount(&server)
        .await;

    let app = build_app(test_config(&server.uri()));
    let response = app.oneshot(stream_request(&generation_body())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains(DONE_TOKEN));
}

#[tokio::test]
async fn unparseable_body_is_forwarded_without_injection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(body_string_contains("this is not json"))
        .respond_with(sse_template(&[&finish_line("fine.", "STOP")]))
        .expect(1)
        .mount(&server)
        .await;

    let app = build_app(test_config(&server.uri()));
    let response = app.oneshot(stream_request("this is not json")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("fine."));
}

// ---------------------------------------------------------------------------
// Test 6: Non-streaming pass-through
// ---------------------------------------------------------------------------

#[tokio::test]
async fn non_streaming_request_passes_through_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1beta/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let app = build_app(test_config(&server.uri()));
    let request = Request::builder()
        .method("GET")
        .uri("/v1beta/models")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body, json!({ "models": [] }));
}

#[tokio::test]
async fn non_streaming_error_is_shaped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1beta/models/missing"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({ "error": { "code": 404, "message": "not found" } })),
        )
        .mount(&server)
        .await;

    let app = build_app(test_config(&server.uri()));
    let request = Request::builder()
        .method("GET")
        .uri("/v1beta/models/missing")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"]["status"], "NOT_FOUND");
}

// ---------------------------------------------------------------------------
// Test 7: Health and CORS
// ---------------------------------------------------------------------------

#[tokio::test]
async fn healthz_reports_ok() {
    let app = build_app(test_config("http://unused.example"));
    let request = Request::builder()
        .method("GET")
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn cors_preflight_is_answered_locally() {
    let app = build_app(test_config("http://unused.example"));
    let request = Request::builder()
        .method("OPTIONS")
        .uri(STREAM_PATH)
        .header("origin", "https://app.example")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
    assert!(response
        .headers()
        .get("access-control-allow-headers")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("X-Goog-Api-Key"));
}
