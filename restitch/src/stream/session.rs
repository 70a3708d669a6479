// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Retry engine
//
// The state machine that owns a single downstream response. Each attempt
// consumes one upstream body through the line tokenizer; a legitimate
// completion ends the session, anything else classifies as an interruption
// and triggers a continuation request built from the text already
// delivered. After a retry, thought chunks are swallowed until formal text
// resumes so continuation reasoning never leaks into a stream the client
// already perceives as prose.

use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use serde_json::Value;

use crate::config::Config;
use crate::error::retry_exhaustion_frame;
use crate::inject::build_retry_body;
use crate::upstream::{ByteStream, HttpRequest, HttpSender};

use super::classifier::{classify, is_clean_finish, strip_done_token};
use super::line::spawn_line_reader;
use super::types::{ClassifiedLine, InterruptionReason, DONE_LINE, DONE_TOKEN};
use super::writer::{ClientGone, DownstreamWriter};

/// Consecutive punctuation-terminated drops accepted as completion when the
/// heuristic is enabled.
const PUNCTUATION_STREAK_LIMIT: u32 = 3;

/// Sentence-final characters recognized by the punctuation heuristic.
const SENTENCE_FINAL: [char; 7] = ['.', '!', '?', '…', '。', '！', '？'];

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Terminal failures of a session. Retryable conditions never surface here;
/// recovering them without telling the client is the point of the engine.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("retry limit exceeded")]
    RetryLimitExceeded,

    #[error(transparent)]
    ClientDisconnected(#[from] ClientGone),
}

enum AttemptResult {
    Clean,
    Interrupted(InterruptionReason),
}

/// One streaming session: lifetime = one downstream response.
pub struct Session {
    config: Arc<Config>,
    http: Arc<dyn HttpSender>,
    writer: DownstreamWriter,
    original_body: Value,
    upstream_url: String,
    replay_headers: HeaderMap,
    request_id: String,
    accumulated_text: String,
    consecutive_retry_count: usize,
    total_lines_processed: u64,
    session_start: Instant,
    outputting_formal_text: bool,
    swallow_mode_active: bool,
    punctuation_streak: u32,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        http: Arc<dyn HttpSender>,
        writer: DownstreamWriter,
        original_body: Value,
        upstream_url: String,
        replay_headers: HeaderMap,
        request_id: String,
    ) -> Self {
        Self {
            config,
            http,
            writer,
            original_body,
            upstream_url,
            replay_headers,
            request_id,
            accumulated_text: String::new(),
            consecutive_retry_count: 0,
            total_lines_processed: 0,
            session_start: Instant::now(),
            outputting_formal_text: false,
            swallow_mode_active: false,
            punctuation_streak: 0,
        }
    }

    /// Drive the whole lifecycle of one streaming response, retries
    /// included.
    pub async fn process(mut self, initial_body: ByteStream) -> Result<(), SessionError> {
        tracing::info!(
            request_id = %self.request_id,
            max_retries = self.config.max_consecutive_retries,
            "stream session started"
        );

        let mut current = initial_body;
        loop {
            let reason = match self.run_attempt(current).await? {
                AttemptResult::Clean => {
                    tracing::info!(
                        request_id = %self.request_id,
                        duration_ms = self.session_start.elapsed().as_millis() as u64,
                        lines = self.total_lines_processed,
                        chars = self.accumulated_text.len(),
                        retries = self.consecutive_retry_count,
                        "stream completed"
                    );
                    return Ok(());
                }
                AttemptResult::Interrupted(reason) => reason,
            };

            tracing::warn!(
                request_id = %self.request_id,
                reason = %reason,
                accumulated_chars = self.accumulated_text.len(),
                "stream interrupted"
            );

            if self.punctuation_accepts_completion(reason) {
                self.writer.write_line(DONE_LINE).await?;
                tracing::info!(
                    request_id = %self.request_id,
                    "drop accepted as completion by punctuation heuristic"
                );
                return Ok(());
            }

            if self.config.swallow_thoughts_after_retry && self.outputting_formal_text {
                self.swallow_mode_active = true;
            }

            current = self.acquire_retry_stream(reason).await?;
        }
    }

    // -----------------------------------------------------------------------
    // Per-attempt loop
    // -----------------------------------------------------------------------

    async fn run_attempt(&mut self, body: ByteStream) -> Result<AttemptResult, ClientGone> {
        let attempt_start = Instant::now();
        let mut lines_in_stream = 0u64;
        let mut interruption = None;
        let mut clean_exit = false;

        let mut lines = spawn_line_reader(body);
        while let Some(line) = lines.recv().await {
            self.total_lines_processed += 1;
            lines_in_stream += 1;
            if line.is_empty() {
                continue;
            }

            let classified = classify(&line);

            if self.swallow_mode_active {
                if classified.is_thought {
                    if !classified.finish_reason.is_empty() {
                        tracing::warn!(
                            request_id = %self.request_id,
                            finish_reason = %classified.finish_reason,
                            "stream finished on a swallowed thought chunk"
                        );
                        interruption = Some(InterruptionReason::FinishDuringThought);
                        break;
                    }
                    tracing::debug!(request_id = %self.request_id, "swallowing thought chunk");
                    continue;
                }
                tracing::debug!(
                    request_id = %self.request_id,
                    "formal text resumed; leaving swallow mode"
                );
                self.swallow_mode_active = false;
            }

            if let Some(reason) = self.classify_interruption(&classified) {
                interruption = Some(reason);
                break;
            }

            let is_final = is_clean_finish(&classified.finish_reason);
            // The sentinel is a hint for the upstream only; it leaves both
            // the forwarded line and the accumulated context.
            let written_text = match strip_done_token(&line) {
                Some(rewritten) => {
                    self.writer.write_line(&rewritten).await?;
                    classified
                        .text
                        .strip_suffix(DONE_TOKEN)
                        .unwrap_or(&classified.text)
                }
                None => {
                    self.writer.write_line(&line).await?;
                    classified.text.as_str()
                }
            };

            if !written_text.is_empty() && !classified.is_thought {
                self.outputting_formal_text = true;
                self.accumulated_text.push_str(written_text);
            }

            if is_final {
                self.writer.write_line(DONE_LINE).await?;
                tracing::debug!(
                    request_id = %self.request_id,
                    finish_reason = %classified.finish_reason,
                    "finish reason accepted as final"
                );
                clean_exit = true;
                break;
            }
        }

        tracing::debug!(
            request_id = %self.request_id,
            attempt = self.consecutive_retry_count + 1,
            duration_ms = attempt_start.elapsed().as_millis() as u64,
            lines = lines_in_stream,
            "stream attempt finished"
        );

        if clean_exit {
            Ok(AttemptResult::Clean)
        } else {
            // A stream that ends without a finish reason was dropped.
            Ok(AttemptResult::Interrupted(
                interruption.unwrap_or(InterruptionReason::Drop),
            ))
        }
    }

    /// Decide whether this line interrupts the stream. Order matters: a
    /// finish during a thought beats a block beats an empty STOP beats an
    /// abnormal finish; only the first match applies.
    fn classify_interruption(&self, line: &ClassifiedLine<'_>) -> Option<InterruptionReason> {
        if !line.finish_reason.is_empty() && line.is_thought {
            return Some(InterruptionReason::FinishDuringThought);
        }
        if line.is_blocked {
            return Some(InterruptionReason::Block);
        }
        if line.finish_reason == "STOP"
            && self.accumulated_text.trim().is_empty()
            && line.text.trim().is_empty()
        {
            return Some(InterruptionReason::FinishEmptyResponse);
        }
        if !line.finish_reason.is_empty() && !is_clean_finish(&line.finish_reason) {
            return Some(InterruptionReason::FinishAbnormal);
        }
        None
    }

    // -----------------------------------------------------------------------
    // Between attempts
    // -----------------------------------------------------------------------

    /// Issue continuation requests until one yields a stream, the retry
    /// budget runs out, or the client goes away. Failed requests count
    /// against the budget and back off by the configured delay.
    async fn acquire_retry_stream(
        &mut self,
        reason: InterruptionReason,
    ) -> Result<ByteStream, SessionError> {
        loop {
            if self.consecutive_retry_count >= self.config.max_consecutive_retries {
                let frame = retry_exhaustion_frame(
                    self.config.max_consecutive_retries,
                    reason.as_str(),
                    self.accumulated_text.chars().count(),
                );
                self.writer.write_event("error", &frame).await?;
                return Err(SessionError::RetryLimitExceeded);
            }
            self.consecutive_retry_count += 1;
            tracing::info!(
                request_id = %self.request_id,
                retry = self.consecutive_retry_count,
                max_retries = self.config.max_consecutive_retries,
                "starting retry"
            );

            let retry_body = build_retry_body(&self.original_body, &self.accumulated_text);
            let payload = match serde_json::to_vec(&retry_body) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::error!(request_id = %self.request_id, %err, "failed to serialize retry body");
                    tokio::time::sleep(self.config.retry_delay).await;
                    continue;
                }
            };

            let request = HttpRequest {
                method: Method::POST,
                url: self.upstream_url.clone(),
                headers: self.replay_headers.clone(),
                body: Bytes::from(payload),
            };
            match self.http.send(request).await {
                Err(err) => {
                    tracing::error!(
                        request_id = %self.request_id,
                        retry = self.consecutive_retry_count,
                        %err,
                        "retry request failed"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Ok(response) if response.status != StatusCode::OK => {
                    tracing::error!(
                        request_id = %self.request_id,
                        retry = self.consecutive_retry_count,
                        status = %response.status,
                        "retry request rejected"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Ok(response) => {
                    tracing::info!(
                        request_id = %self.request_id,
                        retry = self.consecutive_retry_count,
                        "retry succeeded, resuming stream"
                    );
                    return Ok(response.body);
                }
            }
        }
    }

    /// Cross-attempt completion heuristic: consecutive drops that each left
    /// the response on sentence-final punctuation are accepted as a finished
    /// generation. Off by default.
    fn punctuation_accepts_completion(&mut self, reason: InterruptionReason) -> bool {
        if !self.config.punctuation_heuristic_enabled {
            return false;
        }
        let ends_on_sentence = self
            .accumulated_text
            .trim_end()
            .ends_with(&SENTENCE_FINAL[..]);
        if reason == InterruptionReason::Drop && ends_on_sentence {
            self.punctuation_streak += 1;
        } else {
            self.punctuation_streak = 0;
        }
        self.punctuation_streak >= PUNCTUATION_STREAK_LIMIT
    }
}
