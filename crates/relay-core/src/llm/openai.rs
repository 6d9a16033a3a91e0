//! OpenAI chat-completions adapter, grounded in the teacher's OpenAI provider
//! wire shapes (`providers/openai/src/api.rs`).

use super::{classify_http_error, GenerateOptions, LLMAdapter, Response};
use crate::error::LLMError;
use crate::message::{Conversation, Message, Part, Role};
use crate::tool::{FinishReason, ToolChoice, ToolDescriptor, UsageMetrics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct OpenAiAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    call_counter: AtomicU64,
}

impl OpenAiAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, "https://api.openai.com/v1".to_string())
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url,
            call_counter: AtomicU64::new(0),
        }
    }

    fn next_call_id(&self) -> String {
        format!("call_{}", self.call_counter.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunctionDef,
}

#[derive(Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Deserialize)]
struct ChatResponseWire {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default, alias = "prompt_tokens", alias = "promptTokens", alias = "input_tokens")]
    input_tokens: u64,
    #[serde(default, alias = "completion_tokens", alias = "completionTokens", alias = "output_tokens")]
    output_tokens: u64,
    #[serde(default, alias = "total_tokens", alias = "totalTokens")]
    total_tokens: u64,
}

fn role_to_wire(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn to_wire_messages(conversation: &Conversation) -> Vec<WireMessage> {
    let mut out = Vec::new();
    for message in &conversation.messages {
        match message.role {
            Role::Tool => {
                for part in &message.parts {
                    if let Part::ToolResult {
                        tool_call_id,
                        content,
                        ..
                    } = part
                    {
                        out.push(WireMessage {
                            role: "tool".into(),
                            content: Some(content.clone()),
                            tool_calls: None,
                            tool_call_id: Some(tool_call_id.clone()),
                        });
                    }
                }
            }
            role => {
                let text = message.text();
                let calls: Vec<WireToolCall> = message
                    .tool_calls()
                    .into_iter()
                    .map(|(id, name, args)| WireToolCall {
                        id: id.to_string(),
                        call_type: "function".into(),
                        function: WireFunctionCall {
                            name: name.to_string(),
                            arguments: args.to_string(),
                        },
                    })
                    .collect();
                out.push(WireMessage {
                    role: role_to_wire(role).to_string(),
                    content: if text.is_empty() { None } else { Some(text) },
                    tool_calls: if calls.is_empty() { None } else { Some(calls) },
                    tool_call_id: None,
                });
            }
        }
    }
    out
}

fn finish_reason_from_wire(s: Option<&str>) -> FinishReason {
    match s {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some(_) => FinishReason::Other,
        None => FinishReason::Other,
    }
}

#[async_trait]
impl LLMAdapter for OpenAiAdapter {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn generate_content(
        &self,
        conversation: &Conversation,
        options: &GenerateOptions,
    ) -> Result<Response, LLMError> {
        let tools: Vec<WireTool> = options
            .tools
            .iter()
            .map(|t: &ToolDescriptor| WireTool {
                tool_type: "function".into(),
                function: WireFunctionDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.wire_schema(),
                },
            })
            .collect();

        let tool_choice = if tools.is_empty() || matches!(options.tool_choice, ToolChoice::Auto) {
            None
        } else {
            Some(options.tool_choice.clone())
        };

        let body = ChatRequest {
            model: &options.model,
            messages: to_wire_messages(conversation),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            tools,
            tool_choice,
            response_format: options
                .json_mode
                .then(|| json!({"type": "json_object"})),
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(classify_http_error(status, &headers, &bytes));
        }

        let parsed: ChatResponseWire = serde_json::from_slice(&bytes)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LLMError::ResponseFormatError {
                message: "no choices in response".into(),
                raw_response: String::from_utf8_lossy(&bytes).to_string(),
            })?;

        let mut parts = Vec::new();
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            parts.push(Part::Text { text });
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            let id = if call.id.is_empty() {
                self.next_call_id()
            } else {
                call.id
            };
            parts.push(Part::ToolCall {
                id,
                name: call.function.name,
                arguments_json: call.function.arguments,
            });
        }

        let usage = parsed.usage.unwrap_or_default();
        let usage = UsageMetrics {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
            ..Default::default()
        }
        .with_total_filled();

        Ok(Response {
            message: Message::new(Role::Assistant, parts),
            finish_reason: finish_reason_from_wire(choice.finish_reason.as_deref()),
            usage,
            model: parsed.model.unwrap_or_else(|| options.model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_carry_tool_result_pairing() {
        let mut c = Conversation::new();
        c.push(Message::user("list files"));
        c.push(Message::assistant_tool_calls(vec![Part::ToolCall {
            id: "call_1".into(),
            name: "list_files".into(),
            arguments_json: "{}".into(),
        }]));
        c.push(Message::tool_result(
            "call_1".into(),
            "list_files".into(),
            "a\nb".into(),
        ));
        let wire = to_wire_messages(&c);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[2].role, "tool");
        assert_eq!(wire[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn finish_reason_maps_tool_calls() {
        assert_eq!(finish_reason_from_wire(Some("tool_calls")), FinishReason::ToolCalls);
        assert_eq!(finish_reason_from_wire(Some("banana")), FinishReason::Other);
    }
}
