//! AWS Bedrock adapter, speaking the `Converse` API's own JSON wire shape
//! (not the OpenAI chat-completions envelope the sibling adapters share).
//!
//! Bedrock's native auth is SigV4, which the workspace's dependency stack
//! doesn't carry (no `aws-sigv4`/`aws-sdk-*` crate appears anywhere in the
//! corpus this project is grounded on). Rather than fabricate that
//! dependency, signing is a pluggable hook: `BedrockAdapter` calls it with
//! the request method, URL, and body just before sending, and it returns the
//! headers to attach. The default hook attaches a bearer token, matching
//! Bedrock's long-lived API key auth mode; a caller wanting real SigV4
//! request signing supplies their own `SigningHook`.

use super::{classify_http_error, GenerateOptions, LLMAdapter, Response};
use crate::error::LLMError;
use crate::message::{Conversation, Message, Part, Role};
use crate::tool::{FinishReason, ToolDescriptor, UsageMetrics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Produces the headers to attach to a signed `Converse` request.
pub trait SigningHook: Send + Sync {
    fn sign(&self, method: &str, url: &str, body: &[u8]) -> Vec<(String, String)>;
}

/// Bearer-token auth, matching Bedrock's long-lived API key mode.
struct BearerToken(String);

impl SigningHook for BearerToken {
    fn sign(&self, _method: &str, _url: &str, _body: &[u8]) -> Vec<(String, String)> {
        vec![("authorization".to_string(), format!("Bearer {}", self.0))]
    }
}

pub struct BedrockAdapter {
    client: reqwest::Client,
    base_url: String,
    signer: Box<dyn SigningHook>,
    call_counter: AtomicU64,
}

impl BedrockAdapter {
    /// `api_key` is a Bedrock long-lived API key (bearer token); `region`
    /// selects the regional `bedrock-runtime` endpoint.
    pub fn new(api_key: impl Into<String>, region: impl AsRef<str>) -> Self {
        Self::with_signer(region, Box::new(BearerToken(api_key.into())))
    }

    /// Same as `new`, but with a caller-supplied signing hook (e.g. real
    /// SigV4 request signing) instead of bearer-token auth.
    pub fn with_signer(region: impl AsRef<str>, signer: Box<dyn SigningHook>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("https://bedrock-runtime.{}.amazonaws.com", region.as_ref()),
            signer,
            call_counter: AtomicU64::new(0),
        }
    }

    fn next_call_id(&self) -> String {
        format!("call_{}", self.call_counter.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Serialize)]
struct ConverseRequest {
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<WireTextBlock>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inference_config: Option<InferenceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<ToolConfig>,
}

#[derive(Serialize)]
struct InferenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ToolConfig {
    tools: Vec<WireToolSpec>,
}

#[derive(Serialize)]
struct WireToolSpec {
    #[serde(rename = "toolSpec")]
    tool_spec: WireToolSpecInner,
}

#[derive(Serialize)]
struct WireToolSpecInner {
    name: String,
    description: String,
    #[serde(rename = "inputSchema")]
    input_schema: WireInputSchema,
}

#[derive(Serialize)]
struct WireInputSchema {
    json: Value,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireTextBlock {
    text: String,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireMessage {
    role: String,
    content: Vec<WireContentBlock>,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct WireContentBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "toolUse", skip_serializing_if = "Option::is_none")]
    tool_use: Option<WireToolUse>,
    #[serde(rename = "toolResult", skip_serializing_if = "Option::is_none")]
    tool_result: Option<WireToolResult>,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireToolUse {
    #[serde(rename = "toolUseId")]
    tool_use_id: String,
    name: String,
    input: Value,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireToolResult {
    #[serde(rename = "toolUseId")]
    tool_use_id: String,
    content: Vec<WireTextBlock>,
}

#[derive(Deserialize)]
struct ConverseResponse {
    output: WireOutput,
    #[serde(rename = "stopReason", default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireOutput {
    message: WireMessage,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(rename = "inputTokens", default)]
    input_tokens: u64,
    #[serde(rename = "outputTokens", default)]
    output_tokens: u64,
    #[serde(rename = "totalTokens", default)]
    total_tokens: u64,
}

fn to_wire_messages(conversation: &Conversation) -> (Option<Vec<WireTextBlock>>, Vec<WireMessage>) {
    let mut system = None;
    let mut out = Vec::new();
    for message in &conversation.messages {
        match message.role {
            Role::System => {
                system = Some(vec![WireTextBlock { text: message.text() }]);
            }
            Role::Tool => {
                let blocks: Vec<WireContentBlock> = message
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::ToolResult { tool_call_id, content, .. } => Some(WireContentBlock {
                            text: None,
                            tool_use: None,
                            tool_result: Some(WireToolResult {
                                tool_use_id: tool_call_id.clone(),
                                content: vec![WireTextBlock { text: content.clone() }],
                            }),
                        }),
                        _ => None,
                    })
                    .collect();
                out.push(WireMessage { role: "user".into(), content: blocks });
            }
            role => {
                let mut blocks = Vec::new();
                for part in &message.parts {
                    match part {
                        Part::Text { text } if !text.is_empty() => {
                            blocks.push(WireContentBlock { text: Some(text.clone()), tool_use: None, tool_result: None });
                        }
                        Part::ToolCall { id, name, arguments_json } => {
                            let input = serde_json::from_str(arguments_json)
                                .unwrap_or_else(|_| Value::Object(Default::default()));
                            blocks.push(WireContentBlock {
                                text: None,
                                tool_use: Some(WireToolUse { tool_use_id: id.clone(), name: name.clone(), input }),
                                tool_result: None,
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
        Some("content_filtered") => FinishReason::ContentFilter,
        Some("tool_use") => FinishReason::ToolCalls,
        Some(_) => FinishReason::Other,
        None => FinishReason::Other,
    }
}

#[async_trait]
impl LLMAdapter for BedrockAdapter {
    fn provider_name(&self) -> &str {
        "bedrock"
    }

    async fn generate_content(&self, conversation: &Conversation, options: &GenerateOptions) -> Result<Response, LLMError> {
        let (system, messages) = to_wire_messages(conversation);

        let tools: Vec<WireToolSpec> = options
            .tools
            .iter()
            .map(|t: &ToolDescriptor| WireToolSpec {
                tool_spec: WireToolSpecInner {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: WireInputSchema { json: t.wire_schema() },
                },
            })
            .collect();

        let body = ConverseRequest {
            messages,
            system,
            inference_config: Some(InferenceConfig {
                temperature: options.temperature,
                max_tokens: options.max_tokens,
            }),
            tool_config: (!tools.is_empty()).then_some(ToolConfig { tools }),
        };
        let payload = serde_json::to_vec(&body)?;

        let url = format!("{}/model/{}/converse", self.base_url, options.model);
        let headers = self.signer.sign("POST", &url, &payload);

        let mut request = self.client.post(&url).header("content-type", "application/json");
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let resp = request.body(payload).send().await?;

        let status = resp.status();
        let resp_headers = resp.headers().clone();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(classify_http_error(status, &resp_headers, &bytes));
        }

        let parsed: ConverseResponse = serde_json::from_slice(&bytes)?;

        let mut out_parts = Vec::new();
        for block in parsed.output.message.content {
            if let Some(text) = block.text.filter(|t| !t.is_empty()) {
                out_parts.push(Part::Text { text });
            }
            if let Some(tool_use) = block.tool_use {
                let id = if tool_use.tool_use_id.is_empty() { self.next_call_id() } else { tool_use.tool_use_id };
                out_parts.push(Part::ToolCall {
                    id,
                    name: tool_use.name,
                    arguments_json: tool_use.input.to_string(),
                });
            }
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
            message: Message::new(Role::Assistant, out_parts),
            finish_reason: finish_reason_from_wire(parsed.stop_reason.as_deref()),
            usage,
            model: options.model.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_becomes_a_top_level_system_block() {
        let mut c = Conversation::new();
        c.ensure_system("be terse");
        c.push(Message::user("hi"));
        let (system, messages) = to_wire_messages(&c);
        assert_eq!(system.unwrap()[0].text, "be terse");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn tool_result_round_trips_as_a_user_turn() {
        let mut c = Conversation::new();
        c.push(Message::assistant_tool_calls(vec![Part::ToolCall {
            id: "call_1".into(),
            name: "list_files".into(),
            arguments_json: "{}".into(),
        }]));
        c.push(Message::tool_result("call_1".into(), "list_files".into(), "a\nb".into()));
        let (_, messages) = to_wire_messages(&c);
        assert_eq!(messages[1].role, "user");
        assert!(messages[1].content[0].tool_result.is_some());
    }

    #[test]
    fn finish_reason_maps_tool_use() {
        assert_eq!(finish_reason_from_wire(Some("tool_use")), FinishReason::ToolCalls);
        assert_eq!(finish_reason_from_wire(Some("end_turn")), FinishReason::Stop);
    }

    #[test]
    fn bearer_token_signer_sets_the_authorization_header() {
        let signer = BearerToken("secret".to_string());
        let headers = signer.sign("POST", "https://example.com", b"{}");
        assert_eq!(headers, vec![("authorization".to_string(), "Bearer secret".to_string())]);
    }
}
