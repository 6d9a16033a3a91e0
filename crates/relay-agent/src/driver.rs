//! Conversation driver (C9, spec §4.9): the turn loop.
//!
//! Grounded in the teacher's `agent/execution` turn-loop shape (call LLM,
//! branch on tool calls, append results, repeat until done or out of turns)
//! and in `relay_core::llm::dispatch::Dispatcher` for the fallback ladder
//! this loop delegates each generation call to.

use crate::dispatcher::{virtual_tool_descriptors, CustomTool, DispatchContext, PendingToolCall, ToolDispatcher};
use crate::event_bus::{EventBus, StartKind};
use crate::events::{CompletionStatus, EventPayload};
use crate::large_output::LargeOutputHandler;
use crate::smart_routing::{shortlist_tools, SmartRoutingConfig};
use crate::system_prompt::{build_system_prompt, AgentMode, DiscoveryToggles};
use crate::AgentError;
use relay_core::llm::dispatch::Dispatcher;
use relay_core::llm::split_mixed_assistant_message;
use relay_core::mcp::cache::{GetOrBuildResult, ToolServerCache};
use relay_core::message::{Conversation, Message};
use relay_core::tool::ToolChoice;
use relay_core::{ErrorKind, GenerateOptions, ToolDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEFAULT_TEMPERATURE: f32 = 0.7;
const FORCED_FINAL_ANSWER_PROMPT: &str =
    "You are out of turns, provide final answer now.";

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub max_turns: usize,
    pub mode: AgentMode,
    pub discovery: DiscoveryToggles,
    pub custom_system_prompt: Option<String>,
    pub smart_routing: SmartRoutingConfig,
    pub max_tokens: u32,
    pub tool_choice: ToolChoice,
    pub structured_output_max_retries: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_turns: 25,
            mode: AgentMode::Simple,
            discovery: DiscoveryToggles::default(),
            custom_system_prompt: None,
            smart_routing: SmartRoutingConfig::default(),
            max_tokens: 4096,
            tool_choice: ToolChoice::Auto,
            structured_output_max_retries: 2,
        }
    }
}

/// Per-call context the driver needs but doesn't own: the tool-server
/// landscape discovered for this conversation, custom tools, the
/// large-output sandbox, and the session's identity/cancellation handle.
pub struct AskContext<'a> {
    pub cache: &'a ToolServerCache,
    pub discovered: &'a GetOrBuildResult,
    pub custom_tools: &'a HashMap<String, Arc<dyn CustomTool>>,
    pub large_output: &'a LargeOutputHandler,
    pub session_id: &'a str,
    pub cancel_token: &'a CancellationToken,
}

pub struct ConversationDriver {
    dispatcher: Arc<Dispatcher>,
    tool_dispatcher: Arc<ToolDispatcher>,
    bus: Arc<EventBus>,
    config: DriverConfig,
}

impl ConversationDriver {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        tool_dispatcher: Arc<ToolDispatcher>,
        bus: Arc<EventBus>,
        config: DriverConfig,
    ) -> Self {
        Self {
            dispatcher,
            tool_dispatcher,
            bus,
            config,
        }
    }

    pub async fn ask(&self, ctx: &AskContext<'_>, question: &str) -> Result<String, AgentError> {
        self.bus.emit(EventPayload::UserMessage {
            content: question.to_string(),
        });
        let mut conversation = Conversation::new();
        conversation.push(Message::user(question));
        self.run(ctx, conversation).await
    }

    pub async fn ask_with_history(
        &self,
        ctx: &AskContext<'_>,
        messages: Vec<Message>,
    ) -> Result<String, AgentError> {
        let mut conversation = Conversation::new();
        conversation.push_all(messages);
        self.run(ctx, conversation).await
    }

    /// Structured-output variant (spec §4.9): obtains the free-text answer,
    /// then asks the LLM in JSON mode to coerce it to `schema`, retrying
    /// `structured_output_max_retries` times on validation failure.
    pub async fn ask_structured(
        &self,
        ctx: &AskContext<'_>,
        question: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let text = self.ask(ctx, question).await?;

        let mut last_message = String::new();
        for attempt in 0..=self.config.structured_output_max_retries {
            let coercion_prompt = format!(
                "Convert the following answer into JSON matching this schema. \
                 Respond with ONLY the JSON object, no prose.\n\nSchema:\n{}\n\nAnswer:\n{text}",
                serde_json::to_string_pretty(schema).unwrap_or_default(),
            );
            let mut coercion_conversation = Conversation::new();
            coercion_conversation.push(Message::user(coercion_prompt));
            let options = GenerateOptions {
                model: self.dispatcher.current_model(),
                temperature: Some(0.0),
                max_tokens: Some(self.config.max_tokens),
                json_mode: true,
                response_schema: Some(schema.clone()),
                ..Default::default()
            };

            let response = match self
                .dispatcher
                .generate_with_retry(&coercion_conversation, &options, ctx.cancel_token)
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    last_message = err.to_string();
                    continue;
                }
            };

            match serde_json::from_str::<serde_json::Value>(&response.message.text()) {
                Ok(value) => return Ok(value),
                Err(err) => last_message = err.to_string(),
            }
        }

        Err(AgentError::SchemaCoercionFailed {
            attempts: self.config.structured_output_max_retries + 1,
            message: last_message,
        })
    }

    async fn run(&self, ctx: &AskContext<'_>, mut conversation: Conversation) -> Result<String, AgentError> {
        let mut tools = self.available_tools(ctx);

        let initial_system_text = build_system_prompt(
            ctx.discovered,
            self.config.mode,
            &self.config.discovery,
            self.config.custom_system_prompt.as_deref(),
        );
        conversation.ensure_system(initial_system_text);

        let (_start_event, conversation_corr) =
            self.bus.emit_start(StartKind::Normal, "conversation_start", EventPayload::ConversationStart);

        if self
            .config
            .smart_routing
            .should_activate(tools.len(), ctx.discovered.entries.len())
        {
            let total = tools.len();
            tools = shortlist_tools(&self.dispatcher, &conversation, &tools, &self.dispatcher.current_model()).await;
            self.bus.emit(EventPayload::SmartRoutingApplied {
                kept_tools: tools.iter().map(|t| t.name.clone()).collect(),
                dropped_tools: total.saturating_sub(tools.len()),
            });
        }

        let final_system_text = conversation
            .messages
            .first()
            .map(Message::text)
            .unwrap_or_default();
        self.bus.emit(EventPayload::SystemPrompt { text: final_system_text });

        for turn in 1..=self.config.max_turns {
            if ctx.cancel_token.is_cancelled() {
                self.bus.emit(EventPayload::ConversationCancelled);
                return Err(AgentError::Cancelled);
            }
            self.bus.emit_start(
                StartKind::ConversationTurn,
                "conversation_turn",
                EventPayload::ConversationTurn { turn },
            );

            match self.run_one_turn(ctx, &mut conversation, &tools).await? {
                TurnOutcome::Final(text) => {
                    self.bus.emit(EventPayload::UnifiedCompletion {
                        status: CompletionStatus::Completed,
                        turns: turn,
                    });
                    self.bus.emit_end(
                        &conversation_corr,
                        EventPayload::ConversationEnd { final_text: text.clone() },
                    );
                    return Ok(text);
                }
                TurnOutcome::LlmFailed(err) => {
                    self.bus.emit_end(
                        &conversation_corr,
                        EventPayload::ConversationError { message: err.to_string() },
                    );
                    return Err(AgentError::Llm(err));
                }
                TurnOutcome::Cancelled => {
                    self.bus.emit(EventPayload::ConversationCancelled);
                    return Err(AgentError::Cancelled);
                }
                TurnOutcome::Continue => {}
            }
        }

        self.bus.emit(EventPayload::MaxTurnsReached {
            max_turns: self.config.max_turns,
        });
        let final_text = self.forced_final_answer(ctx, &mut conversation).await;
        self.bus.emit(EventPayload::UnifiedCompletion {
            status: CompletionStatus::MaxTurns,
            turns: self.config.max_turns + 1,
        });
        self.bus.emit_end(
            &conversation_corr,
            EventPayload::ConversationEnd { final_text: final_text.clone() },
        );
        Ok(final_text)
    }

    async fn run_one_turn(
        &self,
        ctx: &AskContext<'_>,
        conversation: &mut Conversation,
        tools: &[ToolDescriptor],
    ) -> Result<TurnOutcome, AgentError> {
        let model = self.dispatcher.current_model();
        let options = GenerateOptions {
            model: model.clone(),
            temperature: temperature_for(&model),
            max_tokens: Some(self.config.max_tokens),
            tools: tools.to_vec(),
            tool_choice: self.config.tool_choice.clone(),
            ..Default::default()
        };

        let (_gen_event, gen_corr) = self.bus.emit_start(
            StartKind::Normal,
            "llm_generation",
            EventPayload::LlmGenerationStart {
                model: model.clone(),
                message_count: conversation.messages.len(),
            },
        );

        let response = match self
            .dispatcher
            .generate_with_retry(conversation, &options, ctx.cancel_token)
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                self.bus.emit_end(
                    &gen_corr,
                    EventPayload::LlmGenerationError {
                        model: model.clone(),
                        kind: ErrorKind::classify(&err).into(),
                        message: err.to_string(),
                    },
                );
                return Ok(TurnOutcome::LlmFailed(err));
            }
        };

        self.bus.emit_end(
            &gen_corr,
            EventPayload::LlmGenerationEnd {
                model: response.model.clone(),
                finish_reason: response.finish_reason,
                usage: response.usage,
                tool_call_count: response.message.tool_calls().len(),
            },
        );
        self.bus.emit(EventPayload::TokenUsage { usage: response.usage });

        if !response.message.has_tool_calls() {
            let text = response.message.text();
            conversation.push(response.message);
            return Ok(TurnOutcome::Final(text));
        }

        let pending: Vec<PendingToolCall> = response
            .message
            .tool_calls()
            .into_iter()
            .map(|(id, name, args)| PendingToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments_json: args.to_string(),
            })
            .collect();

        for split_message in split_mixed_assistant_message(response.message) {
            conversation.push(split_message);
        }

        let dispatch_ctx = DispatchContext {
            cache: ctx.cache,
            entries: ctx.discovered,
            custom_tools: ctx.custom_tools,
            large_output: ctx.large_output,
            model: &model,
            session_id: ctx.session_id,
        };
        match self.tool_dispatcher.dispatch_turn(&dispatch_ctx, &pending, ctx.cancel_token).await {
            Ok(results) => {
                conversation.push_all(results);
                Ok(TurnOutcome::Continue)
            }
            Err(()) => Ok(TurnOutcome::Cancelled),
        }
    }

    /// Spec §4.9 "out of turns" path: one final no-tools call, falling back
    /// to the last non-empty assistant text if even that call fails.
    async fn forced_final_answer(&self, ctx: &AskContext<'_>, conversation: &mut Conversation) -> String {
        self.bus.emit(EventPayload::UserMessage {
            content: FORCED_FINAL_ANSWER_PROMPT.to_string(),
        });
        conversation.push(Message::user(FORCED_FINAL_ANSWER_PROMPT));

        let model = self.dispatcher.current_model();
        let options = GenerateOptions {
            model: model.clone(),
            temperature: temperature_for(&model),
            max_tokens: Some(self.config.max_tokens),
            ..Default::default()
        };

        let (_gen_event, gen_corr) = self.bus.emit_start(
            StartKind::Normal,
            "llm_generation",
            EventPayload::LlmGenerationStart {
                model: model.clone(),
                message_count: conversation.messages.len(),
            },
        );

        match self
            .dispatcher
            .generate_with_retry(conversation, &options, ctx.cancel_token)
            .await
        {
            Ok(response) => {
                self.bus.emit_end(
                    &gen_corr,
                    EventPayload::LlmGenerationEnd {
                        model: response.model.clone(),
                        finish_reason: response.finish_reason,
                        usage: response.usage,
                        tool_call_count: response.message.tool_calls().len(),
                    },
                );
                self.bus.emit(EventPayload::TokenUsage { usage: response.usage });
                let text = response.message.text();
                conversation.push(response.message);
                text
            }
            Err(err) => {
                self.bus.emit_end(
                    &gen_corr,
                    EventPayload::LlmGenerationError {
                        model: model.clone(),
                        kind: ErrorKind::classify(&err).into(),
                        message: err.to_string(),
                    },
                );
                conversation.last_assistant_text().unwrap_or_default()
            }
        }
    }

    fn available_tools(&self, ctx: &AskContext<'_>) -> Vec<ToolDescriptor> {
        let mut tools = ctx.discovered.tool_descriptors();
        tools.extend(ctx.custom_tools.values().map(|t| t.descriptor()));
        tools.extend(virtual_tool_descriptors());
        tools
    }
}

enum TurnOutcome {
    Final(String),
    Continue,
    LlmFailed(relay_core::LLMError),
    Cancelled,
}

/// Reasoning-only models reject an explicit `temperature` (spec §4.9: "except
/// o3/o4").
fn temperature_for(model: &str) -> Option<f32> {
    if model.starts_with("o3") || model.starts_with("o4") {
        None
    } else {
        Some(DEFAULT_TEMPERATURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_models_omit_temperature() {
        assert_eq!(temperature_for("o3-mini"), None);
        assert_eq!(temperature_for("o4"), None);
        assert_eq!(temperature_for("gpt-4o"), Some(DEFAULT_TEMPERATURE));
    }
}
