//! Typed event data for the hierarchical event bus (C1, spec §3/§4.1/§6).
//!
//! `EventPayload` replaces the teacher's open, map-typed `AgentEventKind`
//! with a closed set of tagged variants per REDESIGN FLAGS; hierarchy fields
//! live once on the `Event` envelope rather than being duplicated into every
//! payload.

use relay_core::llm::dispatch::FallbackPhase;
use relay_core::{ErrorKind, FinishReason, ToolDescriptor, UsageMetrics};
use serde::{Deserialize, Serialize};

/// One emitted event: hierarchy bookkeeping plus a typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: i64,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub hierarchy_level: u32,
    pub component: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    AgentStart,
    AgentEnd,

    ConversationStart,
    ConversationTurn { turn: usize },
    ConversationEnd { final_text: String },
    ConversationError { message: String },
    ConversationCancelled,

    SystemPrompt { text: String },
    UserMessage { content: String },

    LlmGenerationStart { model: String, message_count: usize },
    LlmGenerationEnd {
        model: String,
        finish_reason: FinishReason,
        usage: UsageMetrics,
        tool_call_count: usize,
    },
    LlmGenerationError { model: String, kind: ErrorKindWire, message: String },
    TokenUsage { usage: UsageMetrics },

    ToolCallStart { tool_call_id: String, tool_name: String, arguments: String },
    ToolCallEnd { tool_call_id: String, tool_name: String, is_error: bool, result: String },
    ToolCallError { tool_call_id: String, tool_name: String, kind: ToolErrorKindWire, message: String },
    BrokenPipeDetected { tool_call_id: String, tool_name: String, server_name: String },
    ToolRecoverySuccess { tool_call_id: String, tool_name: String, server_name: String },
    ToolRecoveryFailed { tool_call_id: String, tool_name: String, server_name: String, message: String },

    FallbackAttempt {
        phase: FallbackPhaseWire,
        index: usize,
        model: String,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
    },
    ModelChange { old_model: String, new_model: String },
    ThrottlingDetected { attempt: usize, wait_secs: u64 },
    StillWaiting { attempt: usize, remaining_secs: u64 },
    AllFallbacksFailed { attempts: usize },

    CacheHit { server_name: String },
    CacheMiss { server_name: String },
    CacheBuildFailed { server_name: String, message: String },

    LargeOutputFileWritten { tool: String, file_path: String, size: usize, preview: String },

    SmartRoutingApplied { kept_tools: Vec<String>, dropped_tools: usize },

    UnifiedCompletion { status: CompletionStatus, turns: usize },
    MaxTurnsReached { max_turns: usize },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    MaxTurns,
    Error,
    Cancelled,
}

/// Wire-stable mirror of `relay_core::ErrorKind` (kept separate so the event
/// schema doesn't change shape if the adapter-facing enum grows variants).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKindWire {
    ContextLength,
    EmptyContent,
    Throttling,
    Connection,
    Stream,
    Internal,
    Other,
}

impl From<ErrorKind> for ErrorKindWire {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ContextLength => ErrorKindWire::ContextLength,
            ErrorKind::EmptyContent => ErrorKindWire::EmptyContent,
            ErrorKind::Throttling => ErrorKindWire::Throttling,
            ErrorKind::Connection => ErrorKindWire::Connection,
            ErrorKind::Stream => ErrorKindWire::Stream,
            ErrorKind::Internal => ErrorKindWire::Internal,
            ErrorKind::Other => ErrorKindWire::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKindWire {
    UnknownTool,
    ArgumentParse,
    EmptyName,
    ToolReportedError,
    Timeout,
    BrokenPipe,
    OtherTransport,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPhaseWire {
    SameProvider,
    CrossProvider,
    ThrottleRetryPrimary,
}

impl From<FallbackPhase> for FallbackPhaseWire {
    fn from(phase: FallbackPhase) -> Self {
        match phase {
            FallbackPhase::SameProvider => FallbackPhaseWire::SameProvider,
            FallbackPhase::CrossProvider => FallbackPhaseWire::CrossProvider,
            FallbackPhase::ThrottleRetryPrimary => FallbackPhaseWire::ThrottleRetryPrimary,
        }
    }
}

/// Helper for C8/system-prompt callers that want to log a discovered tool
/// list alongside an event without pulling the whole descriptor into the
/// wire payload.
pub fn tool_names(tools: &[ToolDescriptor]) -> Vec<String> {
    tools.iter().map(|t| t.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_tags_as_snake_case_type() {
        let payload = EventPayload::ModelChange {
            old_model: "gpt-4o".into(),
            new_model: "gpt-4o-mini".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "model_change");
        assert_eq!(json["old_model"], "gpt-4o");
    }

    #[test]
    fn event_flattens_payload_alongside_envelope_fields() {
        let event = Event {
            timestamp: 1,
            trace_id: "trace-1".into(),
            span_id: "span-1".into(),
            parent_span_id: None,
            hierarchy_level: 1,
            component: "driver",
            correlation_id: None,
            payload: EventPayload::ConversationStart,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "conversation_start");
        assert_eq!(json["trace_id"], "trace-1");
    }
}
