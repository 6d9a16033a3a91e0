//! Shared fixtures for the driver integration tests: a scripted `LLMAdapter`
//! (one step per call, repeating the last step once the script runs out) and
//! small harness functions for wiring a `ConversationDriver` without a real
//! provider or tool-server connection.
//!
//! Modeled on `relay_core::llm::dispatch`'s own `ScriptedAdapter` test
//! fixture, generalized to also script tool-call responses, not just text.

use async_trait::async_trait;
use relay_agent::{ConversationDriver, DriverConfig, ToolDispatcher};
use relay_core::llm::dispatch::{Dispatcher, FallbackConfig, NoopObserver};
use relay_core::message::{Conversation, Message, Part};
use relay_core::tool::{FinishReason, UsageMetrics};
use relay_core::{GenerateOptions, LLMAdapter, LLMError, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub enum Step {
    Text(&'static str),
    ToolCall {
        id: &'static str,
        name: &'static str,
        arguments_json: &'static str,
    },
    Err(LLMError),
}

/// Plays back `steps` in order, one per `generate_content` call; once
/// exhausted, repeats the final step.
pub struct ScriptedAdapter {
    name: &'static str,
    steps: Vec<Step>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(name: &'static str, steps: Vec<Step>) -> Self {
        assert!(!steps.is_empty(), "script must have at least one step");
        Self {
            name,
            steps,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LLMAdapter for ScriptedAdapter {
    fn provider_name(&self) -> &str {
        self.name
    }

    async fn generate_content(
        &self,
        _conversation: &Conversation,
        options: &GenerateOptions,
    ) -> Result<Response, LLMError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = call.min(self.steps.len() - 1);
        match &self.steps[index] {
            Step::Text(text) => Ok(Response {
                message: Message::assistant_text(*text),
                finish_reason: FinishReason::Stop,
                usage: UsageMetrics::default(),
                model: options.model.clone(),
            }),
            Step::ToolCall { id, name, arguments_json } => Ok(Response {
                message: Message::assistant_tool_calls(vec![Part::ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments_json: arguments_json.to_string(),
                }]),
                finish_reason: FinishReason::ToolCalls,
                usage: UsageMetrics::default(),
                model: options.model.clone(),
            }),
            Step::Err(err) => Err(clone_llm_error(err)),
        }
    }
}

pub fn clone_llm_error(err: &LLMError) -> LLMError {
    match err {
        LLMError::HttpError(m) => LLMError::HttpError(m.clone()),
        LLMError::AuthError(m) => LLMError::AuthError(m.clone()),
        LLMError::InvalidRequest(m) => LLMError::InvalidRequest(m.clone()),
        LLMError::ProviderError(m) => LLMError::ProviderError(m.clone()),
        LLMError::JsonError(m) => LLMError::JsonError(m.clone()),
        LLMError::RateLimited { message, retry_after_secs } => LLMError::RateLimited {
            message: message.clone(),
            retry_after_secs: *retry_after_secs,
        },
        LLMError::Timeout(d) => LLMError::Timeout(*d),
        LLMError::Cancelled => LLMError::Cancelled,
        LLMError::ResponseFormatError { message, raw_response } => LLMError::ResponseFormatError {
            message: message.clone(),
            raw_response: raw_response.clone(),
        },
    }
}

pub fn single_adapter(provider: &str, adapter: Arc<dyn LLMAdapter>) -> HashMap<String, Arc<dyn LLMAdapter>> {
    let mut adapters: HashMap<String, Arc<dyn LLMAdapter>> = HashMap::new();
    adapters.insert(provider.to_string(), adapter);
    adapters
}

/// Wires a `ConversationDriver` over `adapters` with no tool-server cache —
/// callers that need real tool dispatch route through `CustomTool`s instead.
pub fn build_driver(
    adapters: HashMap<String, Arc<dyn LLMAdapter>>,
    provider: &str,
    model: &str,
    fallback: FallbackConfig,
    driver_config: DriverConfig,
) -> (ConversationDriver, Arc<relay_agent::EventBus>) {
    let dispatcher = Arc::new(Dispatcher::new(adapters, provider, model, fallback, Arc::new(NoopObserver)));
    let bus = Arc::new(relay_agent::EventBus::new("trace-test", "driver"));
    let tool_dispatcher = Arc::new(ToolDispatcher::new(bus.clone(), Duration::from_secs(5)));
    let driver = ConversationDriver::new(dispatcher, tool_dispatcher, bus.clone(), driver_config);
    (driver, bus)
}
