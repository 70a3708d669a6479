// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Chunk classifier
//
// Pure functions over a single SSE line. Extracts the data payload, the
// text content, the thought flag, the finish reason, and the blocked
// indicator. All inspection is lenient: malformed JSON or missing fields
// classify as an empty non-data line rather than an error.

use serde_json::Value;

use super::types::{ClassifiedLine, DONE_TOKEN};

/// Finish reasons that indicate a safety block rather than a completion.
const BLOCKING_FINISH_REASONS: &[&str] = &["SAFETY", "PROHIBITED_CONTENT"];

// ---------------------------------------------------------------------------
// Line inspection
// ---------------------------------------------------------------------------

/// Whether the line carries the SSE data field prefix.
pub fn is_data_line(line: &str) -> bool {
    line.starts_with("data: ") || line.starts_with("data:")
}

/// The payload after the data prefix, if this is a data line.
fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))
}

/// Whether a finish reason denotes legitimate completion.
pub fn is_clean_finish(reason: &str) -> bool {
    matches!(reason, "STOP" | "MAX_TOKENS")
}

/// Classify a single upstream line.
pub fn classify(line: &str) -> ClassifiedLine<'_> {
    let Some(payload) = data_payload(line) else {
        return ClassifiedLine::empty(line);
    };
    let Ok(json) = serde_json::from_str::<Value>(payload) else {
        return ClassifiedLine::empty(line);
    };

    let candidate = json.get("candidates").and_then(|c| c.get(0));

    let mut text = String::new();
    let mut is_thought = false;
    if let Some(parts) = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
    {
        for part in parts {
            if let Some(part_text) = part.get("text").and_then(Value::as_str) {
                text.push_str(part_text);
            }
            if part.get("thought").is_some_and(is_truthy) {
                is_thought = true;
            }
        }
    }

    let finish_reason = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let blocked_by_feedback = json
        .get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .and_then(Value::as_str)
        .is_some_and(|reason| !reason.is_empty());
    let is_blocked =
        blocked_by_feedback || BLOCKING_FINISH_REASONS.contains(&finish_reason.as_str());

    ClassifiedLine {
        raw: line,
        is_data: true,
        text,
        is_thought,
        finish_reason,
        is_blocked,
    }
}

/// JSON truthiness in the upstream's loose sense: the `thought` marker has
/// been observed as a bool, but numbers and strings occur in the wild.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Sentinel stripping
// ---------------------------------------------------------------------------

/// Remove a trailing `[done]` sentinel from the line's text payload.
///
/// Returns the rewritten line when the concatenated part text ends with the
/// sentinel, `None` when the line should be forwarded untouched. The token
/// is removed from the tail of the part list, so a sentinel that happens to
/// straddle two parts within one line is still stripped. Text that merely
/// *contains* the token mid-payload is left alone.
pub fn strip_done_token(line: &str) -> Option<String> {
    let payload = data_payload(line)?;
    let mut json: Value = serde_json::from_str(payload).ok()?;

    let parts = json
        .get_mut("candidates")?
        .get_mut(0)?
        .get_mut("content")?
        .get_mut("parts")?
        .as_array_mut()?;

    let concatenated: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if !concatenated.ends_with(DONE_TOKEN) {
        return None;
    }

    let mut remaining = DONE_TOKEN.len();
    for part in parts.iter_mut().rev() {
        if remaining == 0 {
            break;
        }
        let Some(text) = part.get("text").and_then(Value::as_str) else {
            continue;
        };
        let keep = text.len().saturating_sub(remaining);
        remaining -= text.len() - keep;
        let trimmed = text[..keep].to_string();
        part["text"] = Value::String(trimmed);
    }

    Some(format!("data: {json}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
