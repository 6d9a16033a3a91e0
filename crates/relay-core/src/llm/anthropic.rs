//! Anthropic Messages API adapter, grounded in the teacher's
//! `providers/anthropic` crate (`AnthropicTool`, `system` as a top-level
//! field rather than an in-band message, `input_schema` naming).

use super::{classify_http_error, GenerateOptions, LLMAdapter, Response};
use crate::error::LLMError;
use crate::message::{Conversation, Message, Part, Role};
use crate::tool::{FinishReason, ToolDescriptor, UsageMetrics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com/v1".to_string(),
        }
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Anthropic has no role for tool results distinct from `user`; results are
/// content blocks inside a user-role message.
fn to_wire_messages(conversation: &Conversation) -> (Option<String>, Vec<WireMessage>) {
    let mut system = None;
    let mut out: Vec<WireMessage> = Vec::new();
    for message in &conversation.messages {
        match message.role {
            Role::System => {
                system = Some(message.text());
            }
            Role::Tool => {
                let blocks: Vec<ContentBlock> = message
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::ToolResult {
                            tool_call_id,
                            content,
                            ..
                        } => Some(ContentBlock::ToolResult {
                            tool_use_id: tool_call_id.clone(),
                            content: content.clone(),
                        }),
                        _ => None,
                    })
                    .collect();
                out.push(WireMessage {
                    role: "user".into(),
                    content: blocks,
                });
            }
            role => {
                let mut blocks = Vec::new();
                for part in &message.parts {
                    match part {
                        Part::Text { text } if !text.is_empty() => {
                            blocks.push(ContentBlock::Text { text: text.clone() });
                        }
                        Part::ToolCall {
                            id,
                            name,
                            arguments_json,
                        } => {
                            let input = serde_json::from_str(arguments_json)
                                .unwrap_or_else(|_| Value::Object(Default::default()));
                            blocks.push(ContentBlock::ToolUse {
                                id: id.clone(),
                                name: name.clone(),
                                input,
                            });
                        }
                        _ => {}
                    }
                }
                out.push(WireMessage {
                    role: match role {
                        Role::User => "user".into(),
                        _ => "assistant".into(),
                    },
                    content: blocks,
                });
            }
        }
    }
    (system, out)
}

fn finish_reason_from_wire(s: Option<&str>) -> FinishReason {
    match s {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some(_) => FinishReason::Other,
        None => FinishReason::Other,
    }
}

#[async_trait]
impl LLMAdapter for AnthropicAdapter {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    async fn generate_content(
        &self,
        conversation: &Conversation,
        options: &GenerateOptions,
    ) -> Result<Response, LLMError> {
        let (system, messages) = to_wire_messages(conversation);

        let tools: Vec<AnthropicTool> = options
            .tools
            .iter()
            .map(|t: &ToolDescriptor| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.wire_schema(),
            })
            .collect();

        let body = MessagesRequest {
            model: &options.model,
            messages,
            system,
            max_tokens: options.max_tokens.unwrap_or(4096),
            temperature: options.temperature,
            tools,
        };

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(classify_http_error(status, &headers, &bytes));
        }

        let parsed: MessagesResponse = serde_json::from_slice(&bytes)?;
        let mut parts = Vec::new();
        for block in parsed.content {
            match block {
                ContentBlock::Text { text } if !text.is_empty() => {
                    parts.push(Part::Text { text });
                }
                ContentBlock::ToolUse { id, name, input } => {
                    parts.push(Part::ToolCall {
                        id,
                        name,
                        arguments_json: input.to_string(),
                    });
                }
                _ => {}
            }
        }

        let usage = parsed.usage.unwrap_or_default();
        let usage = UsageMetrics {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            ..Default::default()
        }
        .with_total_filled();

        Ok(Response {
            message: Message::new(Role::Assistant, parts),
            finish_reason: finish_reason_from_wire(parsed.stop_reason.as_deref()),
            usage,
            model: parsed.model.unwrap_or_else(|| options.model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_is_lifted_out_of_band() {
        let mut c = Conversation::new();
        c.ensure_system("be terse");
        c.push(Message::user("hi"));
        let (system, messages) = to_wire_messages(&c);
        assert_eq!(system.as_deref(), Some("be terse"));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn tool_result_becomes_user_role_content_block() {
        let mut c = Conversation::new();
        c.push(Message::tool_result("call_1".into(), "t".into(), "ok".into()));
        let (_, messages) = to_wire_messages(&c);
        assert_eq!(messages[0].role, "user");
        assert!(matches!(messages[0].content[0], ContentBlock::ToolResult { .. }));
    }
}
