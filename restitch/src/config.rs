// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Runtime configuration
//
// Every option is injected into sessions as `Arc<Config>`; there is no
// global mutable state. The CLI in main.rs populates this from flags and
// environment variables.

use std::time::Duration;

/// Runtime configuration for the proxy.
#[derive(Debug, Clone)]
pub struct Config {
    /// Prefix for all upstream calls; the inbound path and query are
    /// appended verbatim.
    pub upstream_base_url: String,
    /// Upper bound on retries within one session. When reached the session
    /// fails with an SSE error frame.
    pub max_consecutive_retries: usize,
    /// Sleep between retry attempts after a transport or HTTP-status
    /// failure.
    pub retry_delay: Duration,
    /// Hide post-retry thought chunks until formal text resumes.
    pub swallow_thoughts_after_retry: bool,
    /// Treat repeated drops on sentence-final punctuation as completion.
    pub punctuation_heuristic_enabled: bool,
    /// Raise log verbosity.
    pub debug: bool,
    /// Network port to listen on.
    pub port: u16,
    /// Per-key inbound rate limiting.
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests allowed per window per API key.
    pub count: u32,
    pub window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_base_url: "https://generativelanguage.googleapis.com".to_string(),
            max_consecutive_retries: 100,
            retry_delay: Duration::from_millis(750),
            swallow_thoughts_after_retry: true,
            punctuation_heuristic_enabled: false,
            debug: false,
            port: 8080,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            count: 60,
            window: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_consecutive_retries, 100);
        assert_eq!(config.retry_delay, Duration::from_millis(750));
        assert!(config.swallow_thoughts_after_retry);
        assert!(!config.punctuation_heuristic_enabled);
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.port, 8080);
    }
}
