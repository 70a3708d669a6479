// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Per-key rate limiting
//
// A fixed-window counter per API key, consulted once per inbound request
// before any upstream I/O. A caller over its budget is not rejected; it
// waits until the window rolls over, so bursty clients are smoothed rather
// than errored.

use std::time::Duration;

use axum::http::HeaderMap;
use dashmap::DashMap;
use tokio::time::Instant;

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window rate limiter keyed by caller API key.
///
/// Backed by `DashMap` for concurrent access from request handlers.
pub struct RateLimiter {
    buckets: DashMap<String, Window>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// Wait until the key has a slot in the current window, then consume it.
    pub async fn acquire(&self, key: &str) {
        loop {
            let wait = {
                let mut entry = self
                    .buckets
                    .entry(key.to_string())
                    .or_insert_with(|| Window {
                        started: Instant::now(),
                        count: 0,
                    });
                let now = Instant::now();
                if now.duration_since(entry.started) >= self.window {
                    entry.started = now;
                    entry.count = 0;
                }
                if entry.count < self.max_requests {
                    entry.count += 1;
                    None
                } else {
                    Some(self.window - now.duration_since(entry.started))
                }
            };
            // The map guard is released before sleeping.
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Drop windows that have been idle for two full periods.
    pub fn cleanup(&self) {
        let horizon = self.window * 2;
        self.buckets
            .retain(|_, window| window.started.elapsed() < horizon);
    }

    /// Number of tracked keys (for tests).
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

/// The caller's rate-limit key: the API-key header, else a bearer token.
pub fn api_key_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn requests_under_the_limit_pass_immediately() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            limiter.acquire("key").await;
        }
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn request_over_the_limit_waits_for_the_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        limiter.acquire("key").await;
        limiter.acquire("key").await;

        let before = Instant::now();
        limiter.acquire("key").await;
        let waited = before.elapsed();

        assert!(
            waited >= Duration::from_secs(60),
            "expected a full window wait, got {waited:?}"
        );
    }

    #[tokio::test]
    async fn keys_are_limited_independently() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.acquire("alpha").await;
        // A different key is not affected by alpha's spent budget.
        limiter.acquire("beta").await;
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn window_rolls_over_after_the_period() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        limiter.acquire("key").await;
        tokio::time::advance(Duration::from_secs(11)).await;

        let before = Instant::now();
        limiter.acquire("key").await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_idle_windows() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        limiter.acquire("stale").await;
        tokio::time::advance(Duration::from_secs(25)).await;
        limiter.acquire("fresh").await;

        limiter.cleanup();
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn api_key_header_preferred_over_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("gk-123"));
        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        assert_eq!(api_key_from_headers(&headers).as_deref(), Some("gk-123"));
    }

    #[test]
    fn bearer_token_used_when_api_key_absent() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        assert_eq!(api_key_from_headers(&headers).as_deref(), Some("tok"));
    }

    #[test]
    fn no_credentials_yields_no_key() {
        assert_eq!(api_key_from_headers(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(api_key_from_headers(&headers), None);
    }
}
