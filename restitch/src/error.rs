// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Error shaping
//
// Responsibilities:
// - Handler-level failures as typed errors with HTTP responses
// - Google-style error JSON: numeric code, message, and a status string
//   derived from the code when the upstream omitted it
// - The retry-exhaustion payload written as an SSE error frame

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Handler errors
// ---------------------------------------------------------------------------

/// Failures surfaced before any streaming has started.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to connect to upstream server: {0}")]
    UpstreamUnreachable(String),

    #[error("failed to process request body: {0}")]
    BodyRead(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ProxyError::UpstreamUnreachable(_) => {
                (StatusCode::BAD_GATEWAY, "Failed to connect to upstream server")
            }
            ProxyError::BodyRead(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };
        json_error_response(status, error_body(status, message, Some(&self.to_string())))
    }
}

// ---------------------------------------------------------------------------
// Google-style error bodies
// ---------------------------------------------------------------------------

/// Status string for a numeric HTTP code, matching the upstream's own
/// vocabulary.
pub fn google_status(code: StatusCode) -> &'static str {
    match code.as_u16() {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        500 => "INTERNAL",
        503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "UNKNOWN",
    }
}

/// A freshly shaped error body.
pub fn error_body(code: StatusCode, message: &str, detail: Option<&str>) -> Value {
    let mut error = json!({
        "code": code.as_u16(),
        "message": message,
        "status": google_status(code),
    });
    if let Some(detail) = detail {
        error["details"] = json!([{ "@type": "proxy.debug", "detail": detail }]);
    }
    json!({ "error": error })
}

/// Shape a failed upstream response for the client.
///
/// A parseable upstream error object is passed through, gaining a `status`
/// string derived from its numeric `code` (or the HTTP status) when the
/// upstream omitted one. Anything else becomes a standard error body; 429
/// gets the upstream's quota wording.
pub fn shape_upstream_error(status: StatusCode, body: &[u8]) -> Value {
    if let Ok(mut parsed) = serde_json::from_slice::<Value>(body) {
        if let Some(error) = parsed.get_mut("error").and_then(Value::as_object_mut) {
            if !error.contains_key("status") {
                let code = error
                    .get("code")
                    .and_then(Value::as_u64)
                    .and_then(|c| u16::try_from(c).ok())
                    .and_then(|c| StatusCode::from_u16(c).ok())
                    .unwrap_or(status);
                error.insert("status".to_string(), json!(google_status(code)));
            }
            return parsed;
        }
    }

    let message = if status == StatusCode::TOO_MANY_REQUESTS {
        "Resource has been exhausted (e.g. check quota)."
    } else {
        "Request failed"
    };
    let detail = String::from_utf8_lossy(body);
    error_body(status, message, (!detail.is_empty()).then_some(detail.as_ref()))
}

/// The payload of the SSE `event: error` frame written when the retry
/// budget is spent mid-stream.
pub fn retry_exhaustion_frame(limit: usize, reason: &str, accumulated_chars: usize) -> String {
    json!({
        "error": {
            "code": 504,
            "status": "DEADLINE_EXCEEDED",
            "message": format!(
                "Retry limit ({limit}) exceeded after stream interruption. Last reason: {reason}."
            ),
            "details": [{
                "@type": "proxy.debug",
                "accumulated_text_chars": accumulated_chars,
            }],
        }
    })
    .to_string()
}

/// A JSON error response carrying the upstream's status code.
pub fn json_error_response(status: StatusCode, body: Value) -> Response {
    let mut response = (status, axum::Json(body)).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_the_upstream_vocabulary() {
        assert_eq!(google_status(StatusCode::BAD_REQUEST), "INVALID_ARGUMENT");
        assert_eq!(google_status(StatusCode::UNAUTHORIZED), "UNAUTHENTICATED");
        assert_eq!(google_status(StatusCode::FORBIDDEN), "PERMISSION_DENIED");
        assert_eq!(google_status(StatusCode::NOT_FOUND), "NOT_FOUND");
        assert_eq!(
            google_status(StatusCode::TOO_MANY_REQUESTS),
            "RESOURCE_EXHAUSTED"
        );
        assert_eq!(google_status(StatusCode::GATEWAY_TIMEOUT), "DEADLINE_EXCEEDED");
        assert_eq!(google_status(StatusCode::IM_A_TEAPOT), "UNKNOWN");
    }

    #[test]
    fn upstream_error_object_gains_missing_status() {
        let body = br#"{"error":{"code":429,"message":"quota"}}"#;
        let shaped = shape_upstream_error(StatusCode::TOO_MANY_REQUESTS, body);
        assert_eq!(shaped["error"]["status"], "RESOURCE_EXHAUSTED");
        assert_eq!(shaped["error"]["message"], "quota");
    }

    #[test]
    fn upstream_error_object_keeps_existing_status() {
        let body = br#"{"error":{"code":400,"message":"bad","status":"FAILED_PRECONDITION"}}"#;
        let shaped = shape_upstream_error(StatusCode::BAD_REQUEST, body);
        assert_eq!(shaped["error"]["status"], "FAILED_PRECONDITION");
    }

    #[test]
    fn status_derived_from_error_code_over_http_status() {
        // The embedded numeric code wins over the transport status.
        let body = br#"{"error":{"code":403,"message":"denied"}}"#;
        let shaped = shape_upstream_error(StatusCode::BAD_REQUEST, body);
        assert_eq!(shaped["error"]["status"], "PERMISSION_DENIED");
    }

    #[test]
    fn unparseable_429_gets_the_quota_message() {
        let shaped = shape_upstream_error(StatusCode::TOO_MANY_REQUESTS, b"too fast");
        assert_eq!(
            shaped["error"]["message"],
            "Resource has been exhausted (e.g. check quota)."
        );
        assert_eq!(shaped["error"]["status"], "RESOURCE_EXHAUSTED");
    }

    #[test]
    fn unparseable_error_keeps_raw_body_as_detail() {
        let shaped = shape_upstream_error(StatusCode::SERVICE_UNAVAILABLE, b"overloaded");
        assert_eq!(shaped["error"]["message"], "Request failed");
        assert_eq!(shaped["error"]["details"][0]["detail"], "overloaded");
    }

    #[test]
    fn exhaustion_frame_carries_limit_reason_and_accumulated_chars() {
        let frame = retry_exhaustion_frame(3, "BLOCK", 1234);
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["error"]["code"], 504);
        assert_eq!(parsed["error"]["status"], "DEADLINE_EXCEEDED");
        assert_eq!(
            parsed["error"]["message"],
            "Retry limit (3) exceeded after stream interruption. Last reason: BLOCK."
        );
        assert_eq!(parsed["error"]["details"][0]["accumulated_text_chars"], 1234);
    }
}
