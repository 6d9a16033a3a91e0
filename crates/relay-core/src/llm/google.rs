//! Google Gemini `generateContent` adapter.
//!
//! No source survives in the teacher's `providers/google` crate (Cargo.toml
//! only), so this follows the same request/response/usage-normalization
//! shape as the sibling adapters in this module, adapted to Gemini's
//! `contents`/`parts`/`functionCall` wire vocabulary.

use super::{classify_http_error, GenerateOptions, LLMAdapter, Response};
use crate::error::LLMError;
use crate::message::{Conversation, Message, Part, Role};
use crate::tool::{FinishReason, ToolDescriptor, UsageMetrics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct GoogleAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    call_counter: AtomicU64,
}

impl GoogleAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            call_counter: AtomicU64::new(0),
        }
    }

    fn next_call_id(&self) -> String {
        format!("call_{}", self.call_counter.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Serialize)]
struct GenerateContentRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireToolDecl>,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Serialize)]
struct WireToolDecl {
    function_declarations: Vec<WireFunctionDecl>,
}

#[derive(Serialize)]
struct WireFunctionDecl {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireContent {
    role: String,
    parts: Vec<WirePart>,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireFunctionCall {
    name: String,
    args: Value,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    usage_metadata: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireCandidate {
    content: WireContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

fn to_wire_contents(conversation: &Conversation) -> (Option<WireContent>, Vec<WireContent>) {
    let mut system = None;
    let mut out = Vec::new();
    for message in &conversation.messages {
        match message.role {
            Role::System => {
                system = Some(WireContent {
                    role: "user".into(),
                    parts: vec![WirePart {
                        text: Some(message.text()),
                        function_call: None,
                        function_response: None,
                    }],
                });
            }
            Role::Tool => {
                let parts: Vec<WirePart> = message
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::ToolResult {
                            tool_name, content, ..
                        } => Some(WirePart {
                            text: None,
                            function_call: None,
                            function_response: Some(WireFunctionResponse {
                                name: tool_name.clone(),
                                response: serde_json::json!({ "result": content }),
                            }),
                        }),
                        _ => None,
                    })
                    .collect();
                out.push(WireContent {
                    role: "function".into(),
                    parts,
                });
            }
            role => {
                let mut parts = Vec::new();
                for part in &message.parts {
                    match part {
                        Part::Text { text } if !text.is_empty() => {
                            parts.push(WirePart {
                                text: Some(text.clone()),
                                function_call: None,
                                function_response: None,
                            });
                        }
                        Part::ToolCall { name, arguments_json, .. } => {
                            let args = serde_json::from_str(arguments_json)
                                .unwrap_or_else(|_| Value::Object(Default::default()));
                            parts.push(WirePart {
                                text: None,
                                function_call: Some(WireFunctionCall {
                                    name: name.clone(),
                                    args,
                                }),
                                function_response: None,
                            });
                        }
                        _ => {}
                    }
                }
                out.push(WireContent {
                    role: match role {
                        Role::User => "user".into(),
                        _ => "model".into(),
                    },
                    parts,
                });
            }
        }
    }
    (system, out)
}

fn finish_reason_from_wire(s: Option<&str>) -> FinishReason {
    match s {
        Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") => FinishReason::ContentFilter,
        Some(_) => FinishReason::Other,
        None => FinishReason::Other,
    }
}

#[async_trait]
impl LLMAdapter for GoogleAdapter {
    fn provider_name(&self) -> &str {
        "google"
    }

    async fn generate_content(
        &self,
        conversation: &Conversation,
        options: &GenerateOptions,
    ) -> Result<Response, LLMError> {
        let (system_instruction, contents) = to_wire_contents(conversation);

        let tools: Vec<WireToolDecl> = if options.tools.is_empty() {
            Vec::new()
        } else {
            vec![WireToolDecl {
                function_declarations: options
                    .tools
                    .iter()
                    .map(|t: &ToolDescriptor| WireFunctionDecl {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.wire_schema(),
                    })
                    .collect(),
            }]
        };

        let body = GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: Some(GenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_tokens,
                response_mime_type: options.json_mode.then(|| "application/json".to_string()),
            }),
            tools,
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, options.model, self.api_key
        );
        let resp = self.client.post(url).json(&body).send().await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(classify_http_error(status, &headers, &bytes));
        }

        let parsed: GenerateContentResponse = serde_json::from_slice(&bytes)?;
        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LLMError::ResponseFormatError {
                message: "no candidates in response".into(),
                raw_response: String::from_utf8_lossy(&bytes).to_string(),
            })?;

        let mut out_parts = Vec::new();
        for part in candidate.content.parts {
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                out_parts.push(Part::Text { text });
            }
            if let Some(call) = part.function_call {
                out_parts.push(Part::ToolCall {
                    id: self.next_call_id(),
                    name: call.name,
                    arguments_json: call.args.to_string(),
                });
            }
        }

        let usage = parsed.usage_metadata.unwrap_or_default();
        let usage = UsageMetrics {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
            ..Default::default()
        }
        .with_total_filled();

        Ok(Response {
            message: Message::new(Role::Assistant, out_parts),
            finish_reason: finish_reason_from_wire(candidate.finish_reason.as_deref()),
            usage,
            model: options.model.clone(),
        })
    }
}
