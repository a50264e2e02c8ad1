//! Provider Failure Classification
//!
//! Turns an HTTP error status, its headers and body into a provider error the
//! caller can act on.

use crate::error::{LlmaoError, ProviderErrorKind};
use reqwest::header::HeaderMap;
use std::time::Duration;

/// Build a provider error from a non-success response
pub fn provider_error(status: u16, headers: &HeaderMap, body: &str) -> LlmaoError {
    build(status, headers, body, error_message(body))
}

/// Build a provider error for a non-success response whose body could not be
/// read; the read failure becomes the message
pub fn unreadable_body_error(status: u16, headers: &HeaderMap, reason: &str) -> LlmaoError {
    build(
        status,
        headers,
        "",
        format!("failed to read error response body: {}", reason),
    )
}

fn build(status: u16, headers: &HeaderMap, body: &str, message: String) -> LlmaoError {
    let kind = classify(status, body);
    let retry_after = if kind == ProviderErrorKind::RateLimited {
        retry_after(headers)
    } else {
        None
    };

    LlmaoError::Provider {
        kind,
        status,
        message,
        retry_after,
        target: None,
    }
}

/// Classify an error status and body
pub fn classify(status: u16, body: &str) -> ProviderErrorKind {
    if is_rate_limit_error(status, body) {
        return ProviderErrorKind::RateLimited;
    }

    match status {
        401 | 403 => ProviderErrorKind::Authentication,
        400..=499 => ProviderErrorKind::InvalidRequest,
        500..=599 => ProviderErrorKind::Server,
        _ => ProviderErrorKind::Other,
    }
}

/// Classify a vendor error `type` string, as sent inside error payloads
pub fn kind_from_error_type(error_type: &str) -> ProviderErrorKind {
    let lower = error_type.to_lowercase();
    if lower.contains("rate") || lower.contains("quota") {
        ProviderErrorKind::RateLimited
    } else if lower.contains("auth") || lower.contains("permission") {
        ProviderErrorKind::Authentication
    } else if lower.contains("overloaded") || lower.contains("server") || lower == "api_error" {
        ProviderErrorKind::Server
    } else if lower.contains("invalid") || lower.contains("not_found") {
        ProviderErrorKind::InvalidRequest
    } else {
        ProviderErrorKind::Other
    }
}

/// Detect if a response indicates a rate limit error
pub fn is_rate_limit_error(status: u16, body: &str) -> bool {
    // HTTP 429 Too Many Requests
    if status == 429 {
        return true;
    }

    // Some providers return 400 or 403 with rate limit messages
    if !(400..500).contains(&status) {
        return false;
    }
    let lower_body = body.to_lowercase();
    lower_body.contains("rate limit")
        || lower_body.contains("rate_limit")
        || lower_body.contains("too many requests")
        || lower_body.contains("quota exceeded")
}

/// Pull the human-readable message out of a vendor error body
pub fn error_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("message"))
            .or_else(|| v.get("error").filter(|e| e.is_string()))
            .and_then(|m| m.as_str())
    });

    match message {
        Some(m) => m.to_string(),
        None if body.trim().is_empty() => "empty response body".to_string(),
        None => body.chars().take(500).collect(),
    }
}

/// Parse the `retry-after` header (seconds or a duration string)
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    parse_duration_string(value)
}

/// Parse a duration string like "1m30s" or "2h" into a Duration
fn parse_duration_string(s: &str) -> Option<Duration> {
    let s = s.trim();

    // Handle milliseconds first
    if let Some(stripped) = s.strip_suffix("ms") {
        return stripped.parse::<u64>().ok().map(Duration::from_millis);
    }

    // Compound forms (e.g., "1m30s", "2h30m")
    if s.contains('h') || (s.contains('m') && s.contains('s')) {
        let mut total_secs = 0u64;
        let mut current_num = String::new();

        for c in s.chars() {
            if c.is_ascii_digit() {
                current_num.push(c);
            } else if !current_num.is_empty() {
                if let Ok(n) = current_num.parse::<u64>() {
                    match c {
                        'h' => total_secs += n * 3600,
                        'm' => total_secs += n * 60,
                        's' => total_secs += n,
                        _ => {}
                    }
                }
                current_num.clear();
            }
        }

        if total_secs > 0 {
            return Some(Duration::from_secs(total_secs));
        }
    }

    // Simple cases - single unit
    if let Some(stripped) = s.strip_suffix('s') {
        return stripped.parse::<f64>().ok().map(Duration::from_secs_f64);
    }
    if let Some(stripped) = s.strip_suffix('m') {
        return stripped
            .parse::<u64>()
            .ok()
            .map(|mins| Duration::from_secs(mins * 60));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_string() {
        assert_eq!(parse_duration_string("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_string("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration_string("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(
            parse_duration_string("1m30s"),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            parse_duration_string("500ms"),
            Some(Duration::from_millis(500))
        );
        assert_eq!(parse_duration_string("soon"), None);
    }

    #[test]
    fn test_is_rate_limit_error() {
        assert!(is_rate_limit_error(429, ""));
        assert!(is_rate_limit_error(400, "rate limit exceeded"));
        assert!(is_rate_limit_error(403, "Too Many Requests"));
        assert!(!is_rate_limit_error(200, "success"));
        assert!(!is_rate_limit_error(500, "internal error"));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(401, ""), ProviderErrorKind::Authentication);
        assert_eq!(classify(403, "forbidden"), ProviderErrorKind::Authentication);
        assert_eq!(classify(429, ""), ProviderErrorKind::RateLimited);
        assert_eq!(classify(404, "no such model"), ProviderErrorKind::InvalidRequest);
        assert_eq!(classify(503, "overloaded"), ProviderErrorKind::Server);
    }

    #[test]
    fn test_unreadable_body_keeps_read_failure() {
        let err = unreadable_body_error(502, &HeaderMap::new(), "connection reset");
        match err {
            LlmaoError::Provider {
                kind,
                status,
                message,
                ..
            } => {
                assert_eq!(kind, ProviderErrorKind::Server);
                assert_eq!(status, 502);
                assert!(message.contains("connection reset"));
                assert!(!message.contains("empty response body"));
            }
            other => panic!("expected provider error, got {:?}", other),
        }
    }

    #[test]
    fn test_provider_error_from_rate_limit_response() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "5".parse().unwrap());
        let body = r#"{"error": {"message": "Rate limit reached", "type": "rate_limit_error"}}"#;

        match provider_error(429, &headers, body) {
            LlmaoError::Provider {
                kind,
                status,
                message,
                retry_after,
                target,
            } => {
                assert_eq!(kind, ProviderErrorKind::RateLimited);
                assert_eq!(status, 429);
                assert_eq!(message, "Rate limit reached");
                assert_eq!(retry_after, Some(Duration::from_secs(5)));
                assert!(target.is_none());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_message_fallbacks() {
        assert_eq!(error_message(r#"{"message": "bad key"}"#), "bad key");
        assert_eq!(error_message(r#"{"error": "nope"}"#), "nope");
        assert_eq!(error_message("plain text"), "plain text");
        assert_eq!(error_message(""), "empty response body");
    }

    #[test]
    fn test_kind_from_error_type() {
        assert_eq!(
            kind_from_error_type("rate_limit_error"),
            ProviderErrorKind::RateLimited
        );
        assert_eq!(
            kind_from_error_type("authentication_error"),
            ProviderErrorKind::Authentication
        );
        assert_eq!(kind_from_error_type("overloaded_error"), ProviderErrorKind::Server);
        assert_eq!(
            kind_from_error_type("invalid_request_error"),
            ProviderErrorKind::InvalidRequest
        );
    }
}
