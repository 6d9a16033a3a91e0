//! Provider-agnostic LLM adapter layer (spec §4.4/C4).

mod anthropic;
mod bedrock;
mod google;
mod openai;
mod openrouter;

pub mod dispatch;

pub use anthropic::AnthropicAdapter;
pub use bedrock::{BedrockAdapter, SigningHook};
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;
pub use openrouter::OpenRouterAdapter;

use crate::error::LLMError;
use crate::message::Conversation;
use crate::tool::{FinishReason, ToolChoice, ToolDescriptor, UsageMetrics};
use async_trait::async_trait;
use std::sync::Arc;

/// Callback invoked with incremental text as a streaming adapter accumulates a
/// response. The driver never observes streaming directly (spec §4.4) — this
/// exists purely so an embedder can show live progress.
pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-call generation options (spec §4.4).
#[derive(Clone, Default)]
pub struct GenerateOptions {
    pub model: String,
    /// Omitted for reasoning-only models that reject it.
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
    pub tools: Vec<ToolDescriptor>,
    pub tool_choice: ToolChoice,
    pub on_chunk: Option<ChunkCallback>,
    /// Structured-output JSON schema, when the caller wants a shaped response.
    pub response_schema: Option<serde_json::Value>,
}

impl std::fmt::Debug for GenerateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateOptions")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("json_mode", &self.json_mode)
            .field("tools", &self.tools.len())
            .field("tool_choice", &self.tool_choice)
            .field("has_on_chunk", &self.on_chunk.is_some())
            .field("response_schema", &self.response_schema.is_some())
            .finish()
    }
}

/// A normalized LLM response: a single assistant `Message` plus accounting.
#[derive(Debug, Clone)]
pub struct Response {
    pub message: crate::message::Message,
    pub finish_reason: FinishReason,
    pub usage: UsageMetrics,
    pub model: String,
}

/// One adapter per provider (spec §4.4). Implementations normalize role
/// mapping, tool-call id minting, and the mixed text/tool-call split rule
/// before returning; the driver only ever sees the normalized `Response`.
#[async_trait]
pub trait LLMAdapter: Send + Sync {
    /// Stable provider name used for fallback-list bookkeeping (e.g. "openai").
    fn provider_name(&self) -> &str;

    async fn generate_content(
        &self,
        conversation: &Conversation,
        options: &GenerateOptions,
    ) -> Result<Response, LLMError>;
}

/// Infers a provider family from a model id for fallback-list resolution
/// (spec §4.5). Order matters: more specific prefixes are checked first.
pub fn infer_provider(model_id: &str) -> &'static str {
    if model_id.starts_with("us.anthropic.") {
        "bedrock"
    } else if model_id.starts_with("claude-") {
        "anthropic"
    } else if model_id.starts_with("gpt-") || model_id.starts_with("o3") || model_id.starts_with("o4") {
        "openai"
    } else if model_id.contains('/') {
        "openrouter"
    } else {
        "bedrock"
    }
}

/// Splits a mixed text+tool-call assistant message into two messages, text
/// first, per spec §4.4's split rule. No-op if the message doesn't mix both.
pub fn split_mixed_assistant_message(
    message: crate::message::Message,
) -> Vec<crate::message::Message> {
    use crate::message::{Message, Part, Role};

    if message.role != Role::Assistant {
        return vec![message];
    }
    let has_text = message.parts.iter().any(|p| matches!(p, Part::Text { text } if !text.is_empty()));
    let has_tool_calls = message.parts.iter().any(|p| matches!(p, Part::ToolCall { .. }));
    if !(has_text && has_tool_calls) {
        return vec![message];
    }

    let (text_parts, call_parts): (Vec<_>, Vec<_>) = message
        .parts
        .into_iter()
        .partition(|p| matches!(p, Part::Text { .. }));
    vec![
        Message::new(Role::Assistant, text_parts),
        Message::new(Role::Assistant, call_parts),
    ]
}

/// Turns a non-2xx HTTP response into the matching `LLMError` variant,
/// extracting `retry-after`/`x-ratelimit-reset-requests` for 429s and the
/// provider's `error.message` field when the body is JSON.
pub(crate) fn classify_http_error(status: http::StatusCode, headers: &http::HeaderMap, body: &[u8]) -> LLMError {
    let status_code = status.as_u16();
    let retry_after_secs = if status_code == 429 {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .or_else(|| {
                headers
                    .get("x-ratelimit-reset-requests")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_reset_duration)
            })
    } else {
        None
    };

    let error_text = String::from_utf8_lossy(body).to_string();
    let clean_message = serde_json::from_str::<serde_json::Value>(&error_text)
        .ok()
        .and_then(|json| {
            json.pointer("/error/message")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("API returned error status: {status}"));

    match status_code {
        401 | 403 => LLMError::AuthError(clean_message),
        429 => LLMError::RateLimited {
            message: clean_message,
            retry_after_secs,
        },
        400 => LLMError::InvalidRequest(clean_message),
        500 | 529 => LLMError::ProviderError(format!("Server error: {clean_message}")),
        _ => LLMError::ProviderError(clean_message),
    }
}

fn parse_reset_duration(s: &str) -> Option<u64> {
    let s = s.strip_suffix('s')?;
    if let Some(m_pos) = s.find('m') {
        s[..m_pos].parse::<u64>().ok().map(|m| m * 60)
    } else {
        s.parse::<u64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_provider_by_prefix() {
        assert_eq!(infer_provider("gpt-4o"), "openai");
        assert_eq!(infer_provider("o3-mini"), "openai");
        assert_eq!(infer_provider("us.anthropic.claude-3-5-sonnet"), "bedrock");
        assert_eq!(infer_provider("claude-3-5-sonnet"), "anthropic");
        assert_eq!(infer_provider("meta-llama/llama-3"), "openrouter");
        assert_eq!(infer_provider("some-custom-model"), "bedrock");
    }

    #[test]
    fn splits_mixed_text_and_tool_calls() {
        use crate::message::{Message, Part, Role};
        let msg = Message::new(
            Role::Assistant,
            vec![
                Part::text("let me check"),
                Part::ToolCall {
                    id: "call_1".into(),
                    name: "list_files".into(),
                    arguments_json: "{}".into(),
                },
            ],
        );
        let split = split_mixed_assistant_message(msg);
        assert_eq!(split.len(), 2);
        assert!(split[0].text() == "let me check");
        assert!(split[1].has_tool_calls());
    }

    #[test]
    fn leaves_pure_text_message_unsplit() {
        use crate::message::Message;
        let msg = Message::assistant_text("hello");
        assert_eq!(split_mixed_assistant_message(msg).len(), 1);
    }

    #[test]
    fn classifies_429_as_rate_limited_with_retry_after() {
        let mut headers = http::HeaderMap::new();
        headers.insert("retry-after", "12".parse().unwrap());
        let err = classify_http_error(http::StatusCode::TOO_MANY_REQUESTS, &headers, b"{}");
        match err {
            LLMError::RateLimited { retry_after_secs, .. } => {
                assert_eq!(retry_after_secs, Some(12));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn classifies_401_as_auth_error_with_provider_message() {
        let headers = http::HeaderMap::new();
        let body = br#"{"error": {"message": "invalid api key"}}"#;
        let err = classify_http_error(http::StatusCode::UNAUTHORIZED, &headers, body);
        match err {
            LLMError::AuthError(msg) => assert_eq!(msg, "invalid api key"),
            other => panic!("expected AuthError, got {other:?}"),
        }
    }
}
