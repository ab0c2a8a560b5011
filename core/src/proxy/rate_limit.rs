//! Rate limit hints from upstream 429 responses

use once_cell::sync::Lazy;
use regex::Regex;

static RETRY_DELAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:"retryDelay"|"retry_delay")\s*:\s*(?:\{\s*"seconds"\s*:\s*)?"?(\d+)"#).expect("retry delay pattern is valid")
});

/// Seconds the client should wait, from the `Retry-After` header or Google's
/// `RetryInfo.retryDelay` in the error body. The body wins when both exist.
pub fn retry_after_secs(retry_after_header: Option<&str>, error_body: &str) -> Option<u64> {
    let mut wait_secs = retry_after_header.and_then(|v| v.trim().parse::<u64>().ok());

    if error_body.contains("retryDelay") || error_body.contains("retry_delay") {
        if let Some(delay) = parse_retry_delay(error_body) {
            wait_secs = Some(delay);
        }
    }

    wait_secs
}

/// Parse retryDelay from Google error response
fn parse_retry_delay(body: &str) -> Option<u64> {
    // "retryDelay": "60s" or "retry_delay": {"seconds": 60} style
    RETRY_DELAY_RE
        .captures(body)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_google_retry_info() {
        let body = r#"{"error":{"code":429,"details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"37s"}]}}"#;
        assert_eq!(retry_after_secs(None, body), Some(37));
    }

    #[test]
    fn falls_back_to_header() {
        assert_eq!(retry_after_secs(Some("12"), "quota exceeded"), Some(12));
        assert_eq!(retry_after_secs(Some("Wed, 21 Oct 2015 07:28:00 GMT"), ""), None);
    }

    #[test]
    fn reads_structured_seconds() {
        let body = r#"{"error":{"details":[{"retry_delay": {"seconds": 45, "nanos": 0}}]}}"#;
        assert_eq!(retry_after_secs(None, body), Some(45));
        assert_eq!(retry_after_secs(None, r#"{"retryDelay":{"seconds":"8"}}"#), Some(8));
    }

    #[test]
    fn body_overrides_header() {
        assert_eq!(retry_after_secs(Some("5"), r#"{"retryDelay": "20s"}"#), Some(20));
    }
}
