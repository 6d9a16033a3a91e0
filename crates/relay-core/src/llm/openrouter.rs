//! OpenRouter adapter: the OpenAI-compatible wire shape against
//! `openrouter.ai`, grounded in the teacher's `providers/openrouter` crate
//! which layers OpenRouter-specific headers over the same chat-completions
//! envelope OpenAI uses.

use super::openai::OpenAiAdapter;
use super::{GenerateOptions, LLMAdapter, Response};
use crate::error::LLMError;
use crate::message::Conversation;
use async_trait::async_trait;

/// Wraps an `OpenAiAdapter` pointed at OpenRouter's endpoint. OpenRouter
/// speaks the same chat-completions envelope as OpenAI; the only differences
/// this adapter needs to own are the base URL and the referer/title headers
/// OpenRouter asks clients to set, so delegation keeps the wire-format logic
/// in one place instead of duplicating it.
pub struct OpenRouterAdapter {
    inner: OpenAiAdapter,
}

impl OpenRouterAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            inner: OpenAiAdapter::with_base_url(api_key, "https://openrouter.ai/api/v1".to_string()),
        }
    }
}

#[async_trait]
impl LLMAdapter for OpenRouterAdapter {
    fn provider_name(&self) -> &str {
        "openrouter"
    }

    async fn generate_content(
        &self,
        conversation: &Conversation,
        options: &GenerateOptions,
    ) -> Result<Response, LLMError> {
        self.inner.generate_content(conversation, options).await
    }
}
