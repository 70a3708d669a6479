// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use restitch::config::{Config, RateLimitConfig};
use restitch::proxy::{build_router, AppState};
use restitch::ratelimit::RateLimiter;
use restitch::upstream::{build_client, ReqwestHttpSender};

#[derive(Parser)]
#[command(
    name = "restitch",
    about = "Resilient streaming proxy that re-stitches interrupted SSE generations"
)]
struct Cli {
    /// Base URL all upstream calls are prefixed with
    #[arg(
        long,
        default_value = "https://generativelanguage.googleapis.com",
        env = "UPSTREAM_URL_BASE"
    )]
    upstream: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8080, env = "PORT")]
    port: u16,

    /// Upper bound on retries within one streaming session
    #[arg(long, default_value_t = 100, env = "MAX_CONSECUTIVE_RETRIES")]
    max_retries: usize,

    /// Milliseconds to sleep after a failed retry request
    #[arg(long, default_value_t = 750, env = "RETRY_DELAY_MS")]
    retry_delay_ms: u64,

    /// Hide post-retry thought chunks until formal text resumes
    #[arg(
        long,
        default_value_t = true,
        env = "SWALLOW_THOUGHTS_AFTER_RETRY",
        action = clap::ArgAction::Set
    )]
    swallow_thoughts: bool,

    /// Accept repeated drops on sentence-final punctuation as completion
    #[arg(long, env = "PUNCTUATION_HEURISTIC")]
    punctuation_heuristic: bool,

    /// Verbose logging
    #[arg(long, env = "DEBUG_MODE")]
    debug: bool,

    /// Enable per-key inbound rate limiting
    #[arg(long, env = "ENABLE_RATE_LIMIT")]
    rate_limit: bool,

    /// Requests allowed per window per API key
    #[arg(long, default_value_t = 60, env = "RATE_LIMIT_COUNT")]
    rate_limit_count: u32,

    /// Rate limit window in seconds
    #[arg(long, default_value_t = 60, env = "RATE_LIMIT_WINDOW_SECS")]
    rate_limit_window_secs: u64,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            upstream_base_url: self.upstream,
            max_consecutive_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            swallow_thoughts_after_retry: self.swallow_thoughts,
            punctuation_heuristic_enabled: self.punctuation_heuristic,
            debug: self.debug,
            port: self.port,
            rate_limit: RateLimitConfig {
                enabled: self.rate_limit,
                count: self.rate_limit_count,
                window: Duration::from_secs(self.rate_limit_window_secs),
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = Arc::new(cli.into_config());
    tracing::info!(
        upstream = %config.upstream_base_url,
        port = config.port,
        max_retries = config.max_consecutive_retries,
        retry_delay_ms = config.retry_delay.as_millis() as u64,
        swallow_thoughts = config.swallow_thoughts_after_retry,
        rate_limit = config.rate_limit.enabled,
        "config loaded"
    );

    let client = build_client().expect("failed to build upstream HTTP client");
    let limiter = config.rate_limit.enabled.then(|| {
        Arc::new(RateLimiter::new(
            config.rate_limit.count,
            config.rate_limit.window,
        ))
    });

    let state = AppState::new(config.clone(), Arc::new(ReqwestHttpSender::new(client)), limiter);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");
    tracing::info!(%addr, "restitch listening");

    axum::serve(listener, app).await.expect("server error");
}

fn init_tracing(debug: bool) {
    let default = if debug { "restitch=debug" } else { "restitch=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
