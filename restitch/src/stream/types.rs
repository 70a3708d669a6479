// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Stream types
//
// Core types for SSE retry streaming: classified lines, interruption
// reasons, and the shared sentinel/channel constants.

use std::fmt;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// The literal token the injected system instruction asks the model to emit
/// at the very end of its response. Stripped from every payload before
/// forwarding; the downstream client only ever sees the synthesized terminal
/// line below.
pub const DONE_TOKEN: &str = "[done]";

/// The synthesized terminal data line written after a clean finish. This is
/// the only `[done]` the downstream client receives.
pub const DONE_LINE: &str =
    r#"data: {"candidates":[{"content":{"parts":[{"text":"[done]"}]}}]}"#;

/// Capacity of the bounded line channel between the tokenizer task and the
/// engine loop. Gives natural back-pressure when the downstream is slow.
pub const LINE_CHANNEL_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// Classified line
// ---------------------------------------------------------------------------

/// The result of classifying a single upstream SSE line.
///
/// Extraction is lenient: a line that is not a data line, or whose payload
/// is not valid JSON, classifies as [`ClassifiedLine::empty`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedLine<'a> {
    /// The original line, untouched. Used when the line is forwarded.
    pub raw: &'a str,
    /// Whether the line carries the SSE data field prefix.
    pub is_data: bool,
    /// Concatenated `text` of every part under `candidates[0].content`.
    pub text: String,
    /// True if any emitted part carries a truthy `thought` marker.
    pub is_thought: bool,
    /// `candidates[0].finishReason`, or empty when absent.
    pub finish_reason: String,
    /// True if the line reports filtered/blocked content.
    pub is_blocked: bool,
}

impl<'a> ClassifiedLine<'a> {
    /// A non-data classification carrying only the raw line.
    pub fn empty(raw: &'a str) -> Self {
        Self {
            raw,
            is_data: false,
            text: String::new(),
            is_thought: false,
            finish_reason: String::new(),
            is_blocked: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Interruption reasons
// ---------------------------------------------------------------------------

/// Why a stream attempt was judged interrupted rather than complete.
///
/// These are internal: they drive the retry loop and are never surfaced to
/// the client individually. Only the last one appears in the exhaustion
/// error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionReason {
    /// The stream ended without any terminal finish reason.
    Drop,
    /// The upstream's content filter blocked the response.
    Block,
    /// A finish reason arrived on (or while hiding) a thought chunk.
    FinishDuringThought,
    /// `STOP` arrived but the whole response is still blank.
    FinishEmptyResponse,
    /// A finish reason other than `STOP` / `MAX_TOKENS`.
    FinishAbnormal,
}

impl InterruptionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptionReason::Drop => "DROP",
            InterruptionReason::Block => "BLOCK",
            InterruptionReason::FinishDuringThought => "FINISH_DURING_THOUGHT",
            InterruptionReason::FinishEmptyResponse => "FINISH_EMPTY_RESPONSE",
            InterruptionReason::FinishAbnormal => "FINISH_ABNORMAL",
        }
    }
}

impl fmt::Display for InterruptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
