//! Quantified invariants (spec §9) exercised through the full driver rather
//! than by hand-constructing events: turn bound, start/end correlation, and
//! large-output confinement to the session directory.

mod support;

use async_trait::async_trait;
use relay_agent::events::EventPayload;
use relay_agent::{AskContext, CustomTool, DriverConfig, LargeOutputHandler};
use relay_core::llm::dispatch::FallbackConfig;
use relay_core::mcp::cache::{GetOrBuildResult, ToolServerCache};
use relay_core::ToolDescriptor;
use rmcp::model::Implementation;
use std::collections::HashMap;
use std::sync::Arc;
use support::{build_driver, single_adapter, ScriptedAdapter, Step};
use tokio_util::sync::CancellationToken;

struct BigOutputTool;

#[async_trait]
impl CustomTool for BigOutputTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new("dump", "Returns an oversized result.", relay_core::tool::ParametersSchema::default())
    }

    async fn call(&self, _arguments: serde_json::Value) -> Result<String, String> {
        Ok("x".repeat(10_000))
    }
}

fn drain<T>(rx: &mut tokio::sync::mpsc::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn conversation_start_and_end_share_a_correlation_id() {
    let adapter = Arc::new(ScriptedAdapter::new("openai", vec![Step::Text("done")]));
    let (driver, bus) = build_driver(
        single_adapter("openai", adapter),
        "openai",
        "gpt-4o",
        FallbackConfig::default(),
        DriverConfig::default(),
    );
    let mut rx = bus.subscribe();

    let cache = ToolServerCache::new(Implementation::new("relay-agent-tests", "0.0.0"));
    let discovered = GetOrBuildResult { entries: HashMap::new(), failures: Vec::new() };
    let custom_tools: HashMap<String, Arc<dyn CustomTool>> = HashMap::new();
    let large_output = LargeOutputHandler::new(tempfile::tempdir().unwrap().path());
    let cancel_token = CancellationToken::new();
    let ctx = AskContext {
        cache: &cache,
        discovered: &discovered,
        custom_tools: &custom_tools,
        large_output: &large_output,
        session_id: "session-test",
        cancel_token: &cancel_token,
    };

    driver.ask(&ctx, "hi").await.unwrap();
    let events = drain(&mut rx);

    let start = events
        .iter()
        .find(|e| matches!(e.payload, EventPayload::ConversationStart))
        .expect("conversation_start emitted");
    let end = events
        .iter()
        .find(|e| matches!(e.payload, EventPayload::ConversationEnd { .. }))
        .expect("conversation_end emitted");
    assert_eq!(start.correlation_id, end.correlation_id);
    assert!(start.correlation_id.is_some());
}

#[tokio::test]
async fn turn_events_never_exceed_the_configured_max_turns() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "openai",
        vec![
            Step::ToolCall { id: "call_1", name: "noop", arguments_json: "{}" },
            Step::ToolCall { id: "call_2", name: "noop", arguments_json: "{}" },
            Step::ToolCall { id: "call_3", name: "noop", arguments_json: "{}" },
        ],
    ));
    let driver_config = DriverConfig { max_turns: 3, ..Default::default() };
    let (driver, bus) = build_driver(
        single_adapter("openai", adapter),
        "openai",
        "gpt-4o",
        FallbackConfig::default(),
        driver_config,
    );
    let mut rx = bus.subscribe();

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

    let cache = ToolServerCache::new(Implementation::new("relay-agent-tests", "0.0.0"));
    let discovered = GetOrBuildResult { entries: HashMap::new(), failures: Vec::new() };
    let mut custom_tools: HashMap<String, Arc<dyn CustomTool>> = HashMap::new();
    custom_tools.insert("noop".to_string(), Arc::new(NoopTool));
    let large_output = LargeOutputHandler::new(tempfile::tempdir().unwrap().path());
    let cancel_token = CancellationToken::new();
    let ctx = AskContext {
        cache: &cache,
        discovered: &discovered,
        custom_tools: &custom_tools,
        large_output: &large_output,
        session_id: "session-test",
        cancel_token: &cancel_token,
    };

    driver.ask(&ctx, "keep going").await.unwrap();
    let events = drain(&mut rx);

    let turn_count = events.iter().filter(|e| matches!(e.payload, EventPayload::ConversationTurn { .. })).count();
    assert_eq!(turn_count, 3);
    assert!(events.iter().any(|e| matches!(e.payload, EventPayload::MaxTurnsReached { max_turns: 3 })));
}

#[tokio::test]
async fn every_tool_call_start_is_followed_by_a_matching_end() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "openai",
        vec![
            Step::ToolCall { id: "call_1", name: "dump", arguments_json: "{}" },
            Step::Text("done"),
        ],
    ));
    let (driver, bus) = build_driver(
        single_adapter("openai", adapter),
        "openai",
        "gpt-4o",
        FallbackConfig::default(),
        DriverConfig::default(),
    );
    let mut rx = bus.subscribe();

    let cache = ToolServerCache::new(Implementation::new("relay-agent-tests", "0.0.0"));
    let discovered = GetOrBuildResult { entries: HashMap::new(), failures: Vec::new() };
    let mut custom_tools: HashMap<String, Arc<dyn CustomTool>> = HashMap::new();
    custom_tools.insert("dump".to_string(), Arc::new(BigOutputTool));
    let dir = tempfile::tempdir().unwrap();
    let large_output = LargeOutputHandler::new(dir.path());
    let cancel_token = CancellationToken::new();
    let ctx = AskContext {
        cache: &cache,
        discovered: &discovered,
        custom_tools: &custom_tools,
        large_output: &large_output,
        session_id: "session-test",
        cancel_token: &cancel_token,
    };

    driver.ask(&ctx, "dump it").await.unwrap();
    let events = drain(&mut rx);

    let start = events
        .iter()
        .find(|e| matches!(e.payload, EventPayload::ToolCallStart { .. }))
        .expect("tool_call_start emitted");
    let end = events
        .iter()
        .find(|e| matches!(e.payload, EventPayload::ToolCallEnd { .. }))
        .expect("tool_call_end emitted");
    assert_eq!(start.correlation_id, end.correlation_id);

    // The oversized result spilled under the session directory, not loose in the root.
    let spill = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::LargeOutputFileWritten { file_path, .. } => Some(file_path.clone()),
            _ => None,
        })
        .expect("large_output_file_written emitted");
    assert!(spill.starts_with("session-test/"));
    assert!(dir.path().join(&spill).exists());
}
