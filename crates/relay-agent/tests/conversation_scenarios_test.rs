//! End-to-end conversation-driver scenarios (spec §8), driven through
//! `ConversationDriver::ask` with a scripted `LLMAdapter` and, where a tool
//! call is needed, an in-process `CustomTool` — no real MCP connection, so
//! `AskContext::discovered` stays an empty `GetOrBuildResult` throughout.

mod support;

use async_trait::async_trait;
use relay_agent::{AskContext, CustomTool, DriverConfig, LargeOutputHandler};
use relay_core::llm::dispatch::FallbackConfig;
use relay_core::mcp::cache::{GetOrBuildResult, ToolServerCache};
use relay_core::{LLMError, ToolDescriptor};
use rmcp::model::Implementation;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use support::{build_driver, single_adapter, ScriptedAdapter, Step};
use tokio_util::sync::CancellationToken;

struct EchoTool {
    calls: AtomicUsize,
}

impl EchoTool {
    fn new() -> Self {
        Self { calls: AtomicUsize::new(0) }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CustomTool for EchoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new("echo", "Echoes its `value` argument back.", relay_core::tool::ParametersSchema::default())
    }

    async fn call(&self, arguments: serde_json::Value) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = arguments.get("value").and_then(|v| v.as_str()).ok_or("missing `value`")?;
        Ok(format!("got: {value}"))
    }
}

struct NoopTool;

#[async_trait]
impl CustomTool for NoopTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new("noop", "Does nothing.", relay_core::tool::ParametersSchema::default())
    }

    async fn call(&self, _arguments: serde_json::Value) -> Result<String, String> {
        Ok("ok".to_string())
    }
}

fn empty_cache_context<'a>(
    cache: &'a ToolServerCache,
    discovered: &'a GetOrBuildResult,
    custom_tools: &'a HashMap<String, Arc<dyn CustomTool>>,
    large_output: &'a LargeOutputHandler,
    cancel_token: &'a CancellationToken,
) -> AskContext<'a> {
    AskContext {
        cache,
        discovered,
        custom_tools,
        large_output,
        session_id: "session-test",
        cancel_token,
    }
}

#[tokio::test]
async fn single_turn_with_no_tool_calls_returns_the_final_answer() {
    let adapter = Arc::new(ScriptedAdapter::new("openai", vec![Step::Text("hello there")]));
    let (driver, _bus) = build_driver(
        single_adapter("openai", adapter.clone()),
        "openai",
        "gpt-4o",
        FallbackConfig::default(),
        DriverConfig::default(),
    );

    let cache = ToolServerCache::new(Implementation::new("relay-agent-tests", "0.0.0"));
    let discovered = GetOrBuildResult { entries: HashMap::new(), failures: Vec::new() };
    let custom_tools: HashMap<String, Arc<dyn CustomTool>> = HashMap::new();
    let large_output = LargeOutputHandler::new(tempfile::tempdir().unwrap().path());
    let cancel_token = CancellationToken::new();
    let ctx = empty_cache_context(&cache, &discovered, &custom_tools, &large_output, &cancel_token);

    let answer = driver.ask(&ctx, "hi").await.unwrap();
    assert_eq!(answer, "hello there");
    assert_eq!(adapter.call_count(), 1);
}

#[tokio::test]
async fn one_tool_call_then_final_answer_routes_through_a_custom_tool() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "openai",
        vec![
            Step::ToolCall { id: "call_1", name: "echo", arguments_json: r#"{"value":"hi"}"# },
            Step::Text("final answer: hi"),
        ],
    ));
    let (driver, _bus) = build_driver(
        single_adapter("openai", adapter.clone()),
        "openai",
        "gpt-4o",
        FallbackConfig::default(),
        DriverConfig::default(),
    );

    let echo = Arc::new(EchoTool::new());
    let cache = ToolServerCache::new(Implementation::new("relay-agent-tests", "0.0.0"));
    let discovered = GetOrBuildResult { entries: HashMap::new(), failures: Vec::new() };
    let mut custom_tools: HashMap<String, Arc<dyn CustomTool>> = HashMap::new();
    custom_tools.insert("echo".to_string(), echo.clone());
    let large_output = LargeOutputHandler::new(tempfile::tempdir().unwrap().path());
    let cancel_token = CancellationToken::new();
    let ctx = empty_cache_context(&cache, &discovered, &custom_tools, &large_output, &cancel_token);

    let answer = driver.ask(&ctx, "say hi").await.unwrap();
    assert_eq!(answer, "final answer: hi");
    assert_eq!(adapter.call_count(), 2);
    assert_eq!(echo.call_count(), 1);
}

#[tokio::test]
async fn malformed_tool_arguments_are_surfaced_for_the_model_to_self_correct() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "openai",
        vec![
            Step::ToolCall { id: "call_1", name: "echo", arguments_json: "{not valid json" },
            Step::ToolCall { id: "call_2", name: "echo", arguments_json: r#"{"value":"hi"}"# },
            Step::Text("final answer: hi"),
        ],
    ));
    let (driver, _bus) = build_driver(
        single_adapter("openai", adapter.clone()),
        "openai",
        "gpt-4o",
        FallbackConfig::default(),
        DriverConfig::default(),
    );

    let echo = Arc::new(EchoTool::new());
    let cache = ToolServerCache::new(Implementation::new("relay-agent-tests", "0.0.0"));
    let discovered = GetOrBuildResult { entries: HashMap::new(), failures: Vec::new() };
    let mut custom_tools: HashMap<String, Arc<dyn CustomTool>> = HashMap::new();
    custom_tools.insert("echo".to_string(), echo.clone());
    let large_output = LargeOutputHandler::new(tempfile::tempdir().unwrap().path());
    let cancel_token = CancellationToken::new();
    let ctx = empty_cache_context(&cache, &discovered, &custom_tools, &large_output, &cancel_token);

    let answer = driver.ask(&ctx, "say hi").await.unwrap();
    assert_eq!(answer, "final answer: hi");
    assert_eq!(adapter.call_count(), 3);
    // The first call's bad JSON never reached the tool; only the retry did.
    assert_eq!(echo.call_count(), 1);
}

#[tokio::test]
async fn throttling_promotes_a_same_provider_fallback_permanently() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "openai",
        vec![
            Step::Err(LLMError::RateLimited { message: "429 too many requests".into(), retry_after_secs: Some(0) }),
            Step::Text("fallback answer"),
        ],
    ));
    let fallback = FallbackConfig {
        same_provider_models: vec!["gpt-4o-mini".to_string()],
        throttle_base_wait: std::time::Duration::from_millis(1),
        ..Default::default()
    };
    let (driver, _bus) = build_driver(
        single_adapter("openai", adapter.clone()),
        "openai",
        "gpt-4o",
        fallback,
        DriverConfig::default(),
    );

    let cache = ToolServerCache::new(Implementation::new("relay-agent-tests", "0.0.0"));
    let discovered = GetOrBuildResult { entries: HashMap::new(), failures: Vec::new() };
    let custom_tools: HashMap<String, Arc<dyn CustomTool>> = HashMap::new();
    let large_output = LargeOutputHandler::new(tempfile::tempdir().unwrap().path());
    let cancel_token = CancellationToken::new();
    let ctx = empty_cache_context(&cache, &discovered, &custom_tools, &large_output, &cancel_token);

    let answer = driver.ask(&ctx, "hi").await.unwrap();
    assert_eq!(answer, "fallback answer");
    assert_eq!(adapter.call_count(), 2);
}

#[tokio::test]
async fn max_turns_reached_forces_a_final_answer() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "openai",
        vec![
            Step::ToolCall { id: "call_1", name: "noop", arguments_json: "{}" },
            Step::ToolCall { id: "call_2", name: "noop", arguments_json: "{}" },
            Step::Text("forced final"),
        ],
    ));
    let driver_config = DriverConfig {
        max_turns: 2,
        ..Default::default()
    };
    let (driver, _bus) = build_driver(
        single_adapter("openai", adapter.clone()),
        "openai",
        "gpt-4o",
        FallbackConfig::default(),
        driver_config,
    );

    let cache = ToolServerCache::new(Implementation::new("relay-agent-tests", "0.0.0"));
    let discovered = GetOrBuildResult { entries: HashMap::new(), failures: Vec::new() };
    let mut custom_tools: HashMap<String, Arc<dyn CustomTool>> = HashMap::new();
    custom_tools.insert("noop".to_string(), Arc::new(NoopTool));
    let large_output = LargeOutputHandler::new(tempfile::tempdir().unwrap().path());
    let cancel_token = CancellationToken::new();
    let ctx = empty_cache_context(&cache, &discovered, &custom_tools, &large_output, &cancel_token);

    let answer = driver.ask(&ctx, "keep going").await.unwrap();
    assert_eq!(answer, "forced final");
    // Two tool-call turns, then one forced no-tools call.
    assert_eq!(adapter.call_count(), 3);
}
