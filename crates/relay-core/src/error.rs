//! Error types raised by LLM adapters and the dispatch layer.
//!
//! `ErrorKind` is the closed taxonomy from spec §7: adapters only ever raise
//! `LLMError`, and `ErrorKind::classify` is the single place that decides how
//! dispatch should react to it. Keeping classification here (rather than a
//! parallel error-kind enum per provider) avoids the duplicated per-error-kind
//! fallback blocks the teacher's source exhibited.

use thiserror::Error;

/// Errors that can occur when interacting with an LLM provider.
#[derive(Debug, Error)]
pub enum LLMError {
    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("auth error: {0}")]
    AuthError(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("response format error: {message}. raw response: {raw_response}")]
    ResponseFormatError {
        message: String,
        raw_response: String,
    },

    #[error("JSON error: {0}")]
    JsonError(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for LLMError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return LLMError::Timeout(std::time::Duration::from_secs(0));
        }
        LLMError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for LLMError {
    fn from(err: serde_json::Error) -> Self {
        LLMError::JsonError(format!(
            "{err} at line {} column {}",
            err.line(),
            err.column()
        ))
    }
}

/// Closed taxonomy of LLM failure kinds the dispatch layer reacts to (spec §4.5/§7).
///
/// Anything that doesn't match a known indicator classifies as `Other`, which
/// never triggers the fallback ladder — it's surfaced to the caller as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ContextLength,
    EmptyContent,
    Throttling,
    Connection,
    Stream,
    Internal,
    Other,
}

impl ErrorKind {
    /// Whether the fallback ladder (same-provider, then cross-provider) should
    /// run for this kind. Only `Other` is excluded (spec §4.5 item 7).
    pub fn triggers_fallback(self) -> bool {
        !matches!(self, ErrorKind::Other)
    }

    pub fn classify(err: &LLMError) -> ErrorKind {
        if matches!(err, LLMError::RateLimited { .. }) {
            return ErrorKind::Throttling;
        }
        if matches!(err, LLMError::Timeout(_)) {
            return ErrorKind::Connection;
        }
        let text = match err {
            LLMError::ResponseFormatError { message, .. } => message.clone(),
            LLMError::HttpError(m)
            | LLMError::AuthError(m)
            | LLMError::InvalidRequest(m)
            | LLMError::ProviderError(m)
            | LLMError::JsonError(m) => m.clone(),
            _ => String::new(),
        };
        classify_text(&text)
    }
}

/// Empty-assistant-response sentinel checked by the driver before the generic
/// text classifier runs (spec §4.5 item 2).
pub fn looks_like_empty_content(text: &str, had_tool_calls: bool) -> bool {
    !had_tool_calls && text.trim().is_empty()
}

fn classify_text(text: &str) -> ErrorKind {
    let lower = text.to_lowercase();
    const CONTEXT_LENGTH: &[&str] = &[
        "max token",
        "maximum context",
        "context length",
        "context_length_exceeded",
        "input is too long",
        "too many tokens",
    ];
    const THROTTLING: &[&str] = &[
        "429",
        "too many requests",
        "rate limit",
        "throttl",
        "500",
        "502",
        "503",
        "504",
    ];
    const CONNECTION: &[&str] = &[
        "eof",
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "dial tcp",
        "broken pipe",
    ];
    const STREAM: &[&str] = &["stream aborted", "stream closed", "invalid stream id", "sse"];
    const INTERNAL: &[&str] = &["internal server error", "internal error"];

    if CONTEXT_LENGTH.iter().any(|s| lower.contains(s)) {
        return ErrorKind::ContextLength;
    }
    if CONNECTION.iter().any(|s| lower.contains(s)) {
        return ErrorKind::Connection;
    }
    if STREAM.iter().any(|s| lower.contains(s)) {
        return ErrorKind::Stream;
    }
    if THROTTLING.iter().any(|s| lower.contains(s)) {
        return ErrorKind::Throttling;
    }
    if INTERNAL.iter().any(|s| lower.contains(s)) {
        return ErrorKind::Internal;
    }
    ErrorKind::Other
}

/// True when an error string (from a transport error, or from a tool result's
/// own envelope) indicates a dead pipe rather than an application-level error
/// (spec §4.3).
pub fn is_broken_pipe_text(text: &str) -> bool {
    const MARKERS: &[&str] = &[
        "broken pipe",
        "eof",
        "connection reset",
        "connection closed",
        "errno 32",
    ];
    let lower = text.to_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_context_length() {
        let e = LLMError::InvalidRequest("Input is too long for requested model".into());
        assert_eq!(ErrorKind::classify(&e), ErrorKind::ContextLength);
    }

    #[test]
    fn classifies_throttling() {
        let e = LLMError::ProviderError("429 Too Many Requests".into());
        assert_eq!(ErrorKind::classify(&e), ErrorKind::Throttling);
    }

    #[test]
    fn classifies_rate_limited_variant_as_throttling_regardless_of_message() {
        let e = LLMError::RateLimited {
            message: "slow down".into(),
            retry_after_secs: Some(2),
        };
        assert_eq!(ErrorKind::classify(&e), ErrorKind::Throttling);
    }

    #[test]
    fn unknown_text_is_other_and_does_not_trigger_fallback() {
        let e = LLMError::ProviderError("teapot".into());
        let kind = ErrorKind::classify(&e);
        assert_eq!(kind, ErrorKind::Other);
        assert!(!kind.triggers_fallback());
    }

    #[test]
    fn broken_pipe_text_detection() {
        assert!(is_broken_pipe_text("write: broken pipe"));
        assert!(is_broken_pipe_text("unexpected EOF"));
        assert!(!is_broken_pipe_text("invalid argument: path"));
    }
}
