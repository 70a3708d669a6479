// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Prompt injection and retry body construction
//
// Responsibilities:
// - Append the completion-token instruction to `systemInstruction.parts`,
//   whatever shape the field had before (absent, null, wrong type, missing
//   parts), merging any legacy snake_case field into the canonical one first
// - Build the continuation request for a retry: the original contents with
//   a two-message history (model's partial output + the continue directive)
//   inserted right after the last user turn
//
// The request body is an open schema, so everything here works on
// `serde_json::Value` trees rather than typed structs.

use serde_json::{json, Map, Value};

/// The instruction appended to every initial request. Asks the model for a
/// trailing token so a completion can be told apart from a truncation.
pub const DONE_INSTRUCTION: &str = "IMPORTANT: At the very end of your entire response, you must write the token [done] to signal completion. This is a mandatory technical requirement.";

/// The fixed user directive inserted into every retry.
pub const CONTINUATION_DIRECTIVE: &str =
    "Continue exactly where you left off without any preamble or repetition.";

fn instruction_part() -> Value {
    json!({ "text": DONE_INSTRUCTION })
}

// ---------------------------------------------------------------------------
// System instruction injection
// ---------------------------------------------------------------------------

/// Append the completion-token instruction to the body's system instruction.
///
/// Handles every prior shape of `systemInstruction`: absent or null creates
/// the field, a non-mapping value is overwritten, a mapping without a parts
/// sequence gets one, and an existing parts sequence is appended to. A body
/// that is not a JSON object is left untouched.
pub fn inject_done_instruction(body: &mut Value) {
    let Some(map) = body.as_object_mut() else {
        return;
    };
    merge_snake_case_instruction(map);

    let part = instruction_part();
    match map.get_mut("systemInstruction") {
        Some(Value::Object(instruction)) => {
            if let Some(Value::Array(parts)) = instruction.get_mut("parts") {
                parts.push(part);
            } else {
                instruction.insert("parts".to_string(), Value::Array(vec![part]));
            }
        }
        Some(other) => {
            *other = json!({ "parts": [part] });
        }
        None => {
            map.insert("systemInstruction".to_string(), json!({ "parts": [part] }));
        }
    }
}

/// Fold a legacy `system_instruction` field into `systemInstruction`, which
/// is what the upstream consumes. When both exist as mappings with part
/// sequences the snake-case parts are appended; otherwise the canonical
/// field wins. The snake-case key is always removed.
fn merge_snake_case_instruction(map: &mut Map<String, Value>) {
    let Some(snake) = map.remove("system_instruction") else {
        return;
    };

    let camel_missing = matches!(map.get("systemInstruction"), None | Some(Value::Null));
    if camel_missing {
        map.insert("systemInstruction".to_string(), snake);
        return;
    }

    let snake_parts = match snake {
        Value::Object(mut snake_map) => match snake_map.remove("parts") {
            Some(Value::Array(parts)) => parts,
            _ => return,
        },
        _ => return,
    };

    if let Some(Value::Object(camel)) = map.get_mut("systemInstruction") {
        if let Some(Value::Array(parts)) = camel.get_mut("parts") {
            parts.extend(snake_parts);
        } else {
            camel.insert("parts".to_string(), Value::Array(snake_parts));
        }
    }
}

// ---------------------------------------------------------------------------
// Retry body construction
// ---------------------------------------------------------------------------

/// Build the continuation request for a retry.
///
/// The result is a fresh tree: the original (already injected) body with
/// `contents` rebuilt so the two-message continuation history sits
/// immediately after the last `role: user` entry. Without a user turn the
/// history is appended at the end. Empty accumulated text still produces
/// the full history.
pub fn build_retry_body(original: &Value, accumulated_text: &str) -> Value {
    tracing::debug!(
        accumulated_chars = accumulated_text.len(),
        "building retry request body"
    );

    let mut retry = original.clone();
    let history = continuation_history(accumulated_text);

    let Some(map) = retry.as_object_mut() else {
        return retry;
    };
    let contents = match map.get_mut("contents") {
        Some(Value::Array(contents)) => contents,
        _ => {
            map.insert("contents".to_string(), Value::Array(history));
            return retry;
        }
    };

    let last_user = contents
        .iter()
        .rposition(|entry| entry.get("role").and_then(Value::as_str) == Some("user"));
    match last_user {
        Some(index) => {
            contents.splice(index + 1..index + 1, history);
        }
        None => contents.extend(history),
    }

    retry
}

fn continuation_history(accumulated_text: &str) -> Vec<Value> {
    vec![
        json!({ "role": "model", "parts": [{ "text": accumulated_text }] }),
        json!({ "role": "user", "parts": [{ "text": CONTINUATION_DIRECTIVE }] }),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
