// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// HTTP proxy surface
//
// Responsibilities:
// - Streaming detection from the request path/query
// - CORS preflight and health endpoint
// - Rate-limit consultation before any upstream I/O
// - Initial upstream call with prompt injection and error shaping
// - Session spawn with a channel-backed streaming response body
// - Verbatim pass-through for non-streaming requests

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{json_error_response, shape_upstream_error, ProxyError};
use crate::ratelimit::{api_key_from_headers, RateLimiter};
use crate::stream::{DownstreamWriter, Session, SessionError};
use crate::upstream::{replay_headers, ByteStream, HttpRequest, HttpSender};

/// Maximum inbound request body size.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Frames buffered between the session and the response body.
const RESPONSE_CHANNEL_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Shared state injected into axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http: Arc<dyn HttpSender>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        http: Arc<dyn HttpSender>,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Self {
        Self {
            config,
            http,
            limiter,
            started_at: Instant::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Router construction
// ---------------------------------------------------------------------------

/// Build the axum router: the health endpoint plus a catch-all proxy.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .fallback(proxy_handler)
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// Request classification
// ---------------------------------------------------------------------------

/// A POST is streamed when its path mentions streaming or the query asks
/// for SSE. Everything else passes through verbatim.
pub fn is_streaming_request(path: &str, query: Option<&str>) -> bool {
    let path = path.to_ascii_lowercase();
    if path.contains("stream") || path.contains("sse") {
        return true;
    }
    query
        .map(|q| q.split('&').any(|pair| pair == "alt=sse"))
        .unwrap_or(false)
}

/// Upstream target: the configured base with the inbound path and query
/// appended verbatim.
pub fn build_upstream_url(base: &str, uri: &Uri) -> String {
    let base = base.trim_end_matches('/');
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    format!("{base}{path_and_query}")
}

// ---------------------------------------------------------------------------
// Proxy handler
// ---------------------------------------------------------------------------

pub async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let request_id = Uuid::new_v4().to_string();

    if method == Method::OPTIONS {
        return preflight_response();
    }

    if let Some(limiter) = &state.limiter {
        if let Some(key) = api_key_from_headers(&headers) {
            tracing::debug!(request_id = %request_id, "waiting for rate limit slot");
            limiter.acquire(&key).await;
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => return ProxyError::BodyRead(err.to_string()).into_response(),
    };

    let upstream_url = build_upstream_url(&state.config.upstream_base_url, &uri);
    let streaming = method == Method::POST && is_streaming_request(uri.path(), uri.query());
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %uri.path(),
        streaming,
        "proxying request"
    );

    if streaming {
        handle_streaming(state, request_id, upstream_url, headers, body).await
    } else {
        handle_passthrough(state, request_id, method, upstream_url, headers, body).await
    }
}

// ---------------------------------------------------------------------------
// Streaming path
// ---------------------------------------------------------------------------

async fn handle_streaming(
    state: AppState,
    request_id: String,
    upstream_url: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Inject the completion instruction up front so the very same body can
    // seed every retry. An unparseable body is forwarded untouched.
    let (payload, body_for_retry) = match serde_json::from_slice::<Value>(&body) {
        Ok(mut parsed) => {
            crate::inject::inject_done_instruction(&mut parsed);
            match serde_json::to_vec(&parsed) {
                Ok(bytes) => (Bytes::from(bytes), parsed),
                Err(err) => {
                    tracing::warn!(request_id = %request_id, %err, "failed to re-serialize injected body");
                    (body.clone(), Value::Object(Default::default()))
                }
            }
        }
        Err(err) => {
            tracing::warn!(
                request_id = %request_id,
                %err,
                "request body is not JSON; forwarding without injection"
            );
            (body.clone(), Value::Object(Default::default()))
        }
    };

    let replay = replay_headers(&headers);
    let initial = HttpRequest {
        method: Method::POST,
        url: upstream_url.clone(),
        headers: replay.clone(),
        body: payload,
    };
    let upstream = match state.http.send(initial).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(request_id = %request_id, %err, "initial upstream call failed");
            return ProxyError::UpstreamUnreachable(err.to_string()).into_response();
        }
    };

    if upstream.status != StatusCode::OK {
        let error_bytes = collect_body(upstream.body).await;
        tracing::error!(
            request_id = %request_id,
            status = %upstream.status,
            "initial upstream call rejected"
        );
        return json_error_response(
            upstream.status,
            shape_upstream_error(upstream.status, &error_bytes),
        );
    }

    let (writer, rx) = DownstreamWriter::channel(RESPONSE_CHANNEL_CAPACITY);
    let session = Session::new(
        state.config.clone(),
        state.http.clone(),
        writer,
        body_for_retry,
        upstream_url,
        replay,
        request_id.clone(),
    );
    tokio::spawn(async move {
        match session.process(upstream.body).await {
            Ok(()) => {}
            Err(SessionError::ClientDisconnected(_)) => {
                tracing::debug!(request_id = %request_id, "downstream client disconnected");
            }
            Err(SessionError::RetryLimitExceeded) => {
                tracing::error!(request_id = %request_id, "session failed: retry limit exceeded");
            }
        }
    });

    sse_response(rx)
}

/// The streaming response: SSE content type plus anti-buffering headers, a
/// body fed by the session's writer.
fn sse_response(rx: ReceiverStream<Bytes>) -> Response {
    let body = Body::from_stream(rx.map(Ok::<Bytes, Infallible>));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

// ---------------------------------------------------------------------------
// Non-streaming pass-through
// ---------------------------------------------------------------------------

async fn handle_passthrough(
    state: AppState,
    request_id: String,
    method: Method,
    upstream_url: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = if method == Method::GET || method == Method::HEAD {
        Bytes::new()
    } else {
        body
    };
    let request = HttpRequest {
        method,
        url: upstream_url,
        headers: replay_headers(&headers),
        body,
    };

    let upstream = match state.http.send(request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(request_id = %request_id, %err, "upstream call failed");
            return ProxyError::UpstreamUnreachable(err.to_string()).into_response();
        }
    };

    if upstream.status != StatusCode::OK {
        let error_bytes = collect_body(upstream.body).await;
        return json_error_response(
            upstream.status,
            shape_upstream_error(upstream.status, &error_bytes),
        );
    }

    let mut response = Response::new(Body::from_stream(upstream.body));
    *response.status_mut() = upstream.status;
    for (name, value) in upstream.headers.iter() {
        if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
            continue;
        }
        response.headers_mut().insert(name.clone(), value.clone());
    }
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

async fn collect_body(mut body: ByteStream) -> Bytes {
    let mut collected = Vec::new();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => collected.extend_from_slice(&bytes),
            Err(_) => break,
        }
    }
    Bytes::from(collected)
}

// ---------------------------------------------------------------------------
// CORS preflight
// ---------------------------------------------------------------------------

fn preflight_response() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, X-Goog-Api-Key, Accept"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
