// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Upstream transport
//
// Responsibilities:
// - HttpSender trait (dependency injection point for the session and tests)
// - Reqwest-backed implementation with streaming response bodies
// - Shared client construction tuned for long generations
// - Whitelisted header replay for upstream calls

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use futures_util::stream::Stream;
use futures_util::TryStreamExt;

/// A streaming upstream response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, HttpError>> + Send>>;

/// Generous per-request timeout suitable for long generations.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
/// Idle connection pool tuning for the expected concurrency.
const POOL_MAX_IDLE_PER_HOST: usize = 60;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// The only inbound headers replayed to the upstream, on the initial call
/// and on every retry.
const REPLAYED_HEADERS: [HeaderName; 4] = [
    HeaderName::from_static("authorization"),
    HeaderName::from_static("x-goog-api-key"),
    HeaderName::from_static("content-type"),
    HeaderName::from_static("accept"),
];

// ---------------------------------------------------------------------------
// Transport types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("upstream request timed out: {0}")]
    Timeout(String),
}

// ---------------------------------------------------------------------------
// Trait: HttpSender (dependency injection point)
// ---------------------------------------------------------------------------

/// Sends HTTP requests to the upstream API.
///
/// Implementations must be Send + Sync so the session and the handlers can
/// share them via `Arc`. Tests substitute scripted implementations.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

// ---------------------------------------------------------------------------
// Reqwest implementation
// ---------------------------------------------------------------------------

pub struct ReqwestHttpSender {
    client: reqwest::Client,
}

impl ReqwestHttpSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Build the process-global upstream client. Retry attempts reuse its
/// connection pool.
pub fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build()
}

#[async_trait]
impl HttpSender for ReqwestHttpSender {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let resp = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HttpError::Timeout(e.to_string())
                } else {
                    HttpError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .bytes_stream()
            .map_err(|e| HttpError::Transport(e.to_string()));

        Ok(HttpResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

// ---------------------------------------------------------------------------
// Header replay
// ---------------------------------------------------------------------------

/// Copy the whitelisted inbound headers into a fresh header map for an
/// upstream call. Everything else (cookies, forwarding chains, host) stays
/// behind.
pub fn replay_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in REPLAYED_HEADERS {
        if let Some(value) = inbound.get(&name) {
            out.insert(name, value.clone());
        }
    }
    out
}
