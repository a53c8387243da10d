//! The result of one site check, and its JSON wire encoding.
//!
//! A [`ProbeResult`] is built once by the prober, encoded by the publisher,
//! decoded by the consumer and stamped with the broker timestamp before it
//! is handed to storage. The constructors are the only way to build one, so
//! the field invariants below always hold:
//!
//! - exactly one of `error` and `status` is set;
//! - `content_match` is only set for a 200 response;
//! - `body_prefix` is only set for a non-200 response.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of characters of a non-200 response body kept in `body_prefix`.
pub const BODY_PREFIX_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawProbeResult")]
pub struct ProbeResult {
    url: String,
    #[serde(rename = "elapsed")]
    elapsed_ms: u64,
    error: Option<String>,
    status: Option<u16>,
    body_prefix: Option<String>,
    content_match: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl ProbeResult {
    /// Result for a request that failed before any HTTP response arrived.
    pub fn network_error(
        url: impl Into<String>,
        elapsed_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            elapsed_ms,
            error: Some(error.into()),
            status: None,
            body_prefix: None,
            content_match: None,
            timestamp: None,
        }
    }

    /// Result for a received HTTP response.
    ///
    /// A 200 body is searched with `pattern` and the first match is kept;
    /// any other status keeps the first [`BODY_PREFIX_CHARS`] characters of
    /// the body instead.
    pub fn response(
        url: impl Into<String>,
        elapsed_ms: u64,
        status: u16,
        body: &str,
        pattern: &Regex,
    ) -> Self {
        let (body_prefix, content_match) = if status == 200 {
            (None, pattern.find(body).map(|m| m.as_str().to_string()))
        } else {
            (Some(body.chars().take(BODY_PREFIX_CHARS).collect()), None)
        };

        Self {
            url: url.into(),
            elapsed_ms,
            error: None,
            status: Some(status),
            body_prefix,
            content_match,
            timestamp: None,
        }
    }

    /// Returns the same result stamped with the broker-assigned time.
    #[must_use]
    pub fn with_timestamp(self, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..self
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn body_prefix(&self) -> Option<&str> {
        self.body_prefix.as_deref()
    }

    pub fn content_match(&self) -> Option<&str> {
        self.content_match.as_deref()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Encodes the result as a flat JSON object. Absent fields are written
    /// as `null`.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a wire event, rejecting events that break the field invariants.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.url.is_empty() {
            return Err("url is empty".to_string());
        }
        match (&self.error, self.status) {
            (Some(_), Some(_)) => return Err("both error and status are set".to_string()),
            (None, None) => return Err("neither error nor status is set".to_string()),
            _ => {}
        }
        if self.body_prefix.is_some() && self.content_match.is_some() {
            return Err("both body_prefix and content_match are set".to_string());
        }
        if self.content_match.is_some() && self.status != Some(200) {
            return Err("content_match set without a 200 status".to_string());
        }
        if self.body_prefix.is_some() && matches!(self.status, None | Some(200)) {
            return Err("body_prefix set without a non-200 status".to_string());
        }
        Ok(())
    }
}

/// Decoding target; converted into a [`ProbeResult`] only once the
/// invariants are checked.
#[derive(Deserialize)]
struct RawProbeResult {
    url: String,
    elapsed: u64,
    error: Option<String>,
    status: Option<u16>,
    #[serde(default)]
    body_prefix: Option<String>,
    #[serde(default)]
    content_match: Option<String>,
    // Older producers did not send this key, and the consumer overwrites it
    // with the broker time anyway: any value is accepted, only RFC 3339 kept.
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
}

impl TryFrom<RawProbeResult> for ProbeResult {
    type Error = String;

    fn try_from(raw: RawProbeResult) -> std::result::Result<Self, Self::Error> {
        let result = ProbeResult {
            url: raw.url,
            elapsed_ms: raw.elapsed,
            error: raw.error,
            status: raw.status,
            body_prefix: raw.body_prefix,
            content_match: raw.content_match,
            timestamp: raw.timestamp.as_ref().and_then(parse_timestamp),
        };
        result.check_invariants()?;
        Ok(result)
    }
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

/// Compiles a content pattern the way the prober needs it: `.` also
/// matches newlines.
pub fn compile_content_regex(pattern: &str) -> Result<Regex> {
    regex::RegexBuilder::new(pattern)
        .dot_matches_new_line(true)
        .build()
        .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn welcome() -> Regex {
        compile_content_regex(r"Welcome to \w+").unwrap()
    }

    #[test]
    fn test_encode_writes_every_key() {
        let result = ProbeResult::network_error("http://example.test/", 12, "no luck");
        let value: Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "url": "http://example.test/",
                "elapsed": 12,
                "error": "no luck",
                "status": null,
                "body_prefix": null,
                "content_match": null,
                "timestamp": null,
            })
        );
    }

    #[test]
    fn test_response_200_keeps_first_match() {
        let result = ProbeResult::response(
            "http://example.test/",
            3,
            200,
            "<h1>Welcome to nginx!</h1> Welcome to apache",
            &welcome(),
        );
        assert_eq!(result.status(), Some(200));
        assert_eq!(result.error(), None);
        assert_eq!(result.content_match(), Some("Welcome to nginx"));
        assert_eq!(result.body_prefix(), None);
    }

    #[test]
    fn test_response_200_without_match() {
        let result =
            ProbeResult::response("http://example.test/", 3, 200, "It works!", &welcome());
        assert_eq!(result.content_match(), None);
        assert_eq!(result.body_prefix(), None);
    }

    #[test]
    fn test_content_regex_dot_matches_newline() {
        let pattern = compile_content_regex("start.*end").unwrap();
        let result = ProbeResult::response("http://a/", 1, 200, "start\nmiddle\nend", &pattern);
        assert_eq!(result.content_match(), Some("start\nmiddle\nend"));
    }

    #[test]
    fn test_body_prefix_counts_chars_not_bytes() {
        let body = "é".repeat(600);
        let result = ProbeResult::response("http://a/", 1, 503, &body, &welcome());
        let prefix = result.body_prefix().unwrap();
        assert_eq!(prefix.chars().count(), BODY_PREFIX_CHARS);
        assert_eq!(prefix.len(), BODY_PREFIX_CHARS * 2);
        assert_eq!(result.content_match(), None);
    }

    #[test]
    fn test_decode_without_timestamp_key() {
        let payload = br#"{"url":"http://a/","elapsed":5,"error":null,"status":404,"body_prefix":"nope","content_match":null}"#;
        let result = ProbeResult::from_json(payload).unwrap();
        assert_eq!(result.status(), Some(404));
        assert_eq!(result.body_prefix(), Some("nope"));
        assert_eq!(result.timestamp(), None);
    }

    #[test]
    fn test_decode_rejects_error_and_status() {
        let payload = br#"{"url":"http://a/","elapsed":5,"error":"boom","status":200,"body_prefix":null,"content_match":null,"timestamp":null}"#;
        let err = ProbeResult::from_json(payload).unwrap_err();
        assert!(err.to_string().contains("both error and status"), "{err}");
    }

    #[test]
    fn test_decode_rejects_neither_error_nor_status() {
        let payload = br#"{"url":"http://a/","elapsed":5,"error":null,"status":null,"body_prefix":null,"content_match":null,"timestamp":null}"#;
        assert!(ProbeResult::from_json(payload).is_err());
    }

    #[test]
    fn test_decode_rejects_content_match_on_404() {
        let payload = br#"{"url":"http://a/","elapsed":5,"error":null,"status":404,"body_prefix":null,"content_match":"x","timestamp":null}"#;
        assert!(ProbeResult::from_json(payload).is_err());
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        assert!(matches!(
            ProbeResult::from_json(b"{not json"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_decode_ignores_unparseable_timestamp() {
        let payload = br#"{"url":"http://a/","elapsed":5,"error":null,"status":200,"body_prefix":null,"content_match":"foo","timestamp":"1970-01-01 00:00:01"}"#;
        let result = ProbeResult::from_json(payload).unwrap();
        assert_eq!(result.content_match(), Some("foo"));
        assert_eq!(result.timestamp(), None);

        let payload = br#"{"url":"http://a/","elapsed":5,"error":"refused","status":null,"timestamp":17}"#;
        assert_eq!(ProbeResult::from_json(payload).unwrap().timestamp(), None);
    }

    #[test]
    fn test_timestamp_round_trips() {
        let ts = DateTime::from_timestamp_millis(1_000).unwrap();
        let result = ProbeResult::network_error("http://a/", 0, "refused").with_timestamp(ts);
        let decoded = ProbeResult::from_json(result.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(decoded, result);
        assert_eq!(decoded.timestamp(), Some(ts));
    }
}
