//! Tool dispatcher (C6, spec §4.6).
//!
//! Grounded in `relay_core::mcp::cache::ToolServerCache`/`ToolServerHandle`
//! for live-handle lookup and broken-pipe recovery, and in the teacher's
//! `tools/` dispatch loop for the "never abort on a single tool's failure"
//! idiom (each call gets its own result, errors included).

use crate::event_bus::{EventBus, StartKind};
use crate::events::{EventPayload, ToolErrorKindWire};
use crate::large_output::LargeOutputHandler;
use relay_core::mcp::cache::{CacheEntry, GetOrBuildResult, ToolServerCache};
use relay_core::mcp::client::ToolServerError;
use relay_core::message::Message;
use relay_core::tool::{ParameterProperty, ParametersSchema};
use relay_core::ToolDescriptor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const BROKEN_PIPE_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Internal control-flow type for one call's resolve/validate/invoke path
/// (spec §4.6/§7). Never propagates as an `Err` out of the dispatcher —
/// `dispatch_one` converts every variant into a `ToolResultPart` (is_error +
/// message) and, for the wire event, its matching `ToolErrorKindWire`. Exists
/// so the resolve/validate/invoke logic reads as ordinary `?`-propagating
/// Rust instead of threading `(bool, Option<_>, String)` tuples by hand.
#[derive(Debug, thiserror::Error)]
enum ToolDispatchError {
    #[error("Tool call had an empty name. Provide a valid tool name and retry.")]
    EmptyName,

    #[error("Could not parse arguments for `{tool}`: {reason}")]
    ArgumentParse { tool: String, reason: String },

    #[error("{0}")]
    UnknownTool(String),

    #[error("{0}")]
    ToolReportedError(String),

    #[error("Tool `{tool}` timed out after {timeout:?}.")]
    Timeout { tool: String, timeout: Duration },

    #[error("{0}")]
    BrokenPipe(String),

    #[error("Tool `{tool}` failed: {message}")]
    OtherTransport { tool: String, message: String },
}

impl ToolDispatchError {
    fn kind(&self) -> ToolErrorKindWire {
        match self {
            Self::EmptyName => ToolErrorKindWire::EmptyName,
            Self::ArgumentParse { .. } => ToolErrorKindWire::ArgumentParse,
            Self::UnknownTool(_) => ToolErrorKindWire::UnknownTool,
            Self::ToolReportedError(_) => ToolErrorKindWire::ToolReportedError,
            Self::Timeout { .. } => ToolErrorKindWire::Timeout,
            Self::BrokenPipe(_) => ToolErrorKindWire::BrokenPipe,
            Self::OtherTransport { .. } => ToolErrorKindWire::OtherTransport,
        }
    }
}

/// Tool envelopes for the five virtual tools (spec §4.6/§4.7), exposed to the
/// LLM alongside real and custom tools (spec §6: "every exposed tool (real,
/// virtual, custom)...").
pub fn virtual_tool_descriptors() -> Vec<ToolDescriptor> {
    fn string_prop(description: &str) -> ParameterProperty {
        ParameterProperty {
            property_type: "string".to_string(),
            description: description.to_string(),
            items: None,
            enum_list: None,
        }
    }
    fn integer_prop(description: &str) -> ParameterProperty {
        ParameterProperty {
            property_type: "integer".to_string(),
            description: description.to_string(),
            items: None,
            enum_list: None,
        }
    }
    fn boolean_prop(description: &str) -> ParameterProperty {
        ParameterProperty {
            property_type: "boolean".to_string(),
            description: description.to_string(),
            items: None,
            enum_list: None,
        }
    }
    fn schema(required: Vec<&str>, properties: Vec<(&str, ParameterProperty)>) -> ParametersSchema {
        ParametersSchema {
            schema_type: "object".to_string(),
            properties: properties.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            required: required.into_iter().map(str::to_string).collect(),
        }
    }

    vec![
        ToolDescriptor::new(
            "get_prompt",
            "Fetch a named prompt discovered from a connected tool server.",
            schema(
                vec!["server", "name"],
                vec![
                    ("server", string_prop("The server that advertised this prompt.")),
                    ("name", string_prop("The prompt's name.")),
                ],
            ),
        ),
        ToolDescriptor::new(
            "get_resource",
            "Fetch a named resource discovered from a connected tool server.",
            schema(
                vec!["server", "uri"],
                vec![
                    ("server", string_prop("The server that advertised this resource.")),
                    ("uri", string_prop("The resource's URI.")),
                ],
            ),
        ),
        ToolDescriptor::new(
            "read_large_output",
            "Read a 1-based inclusive character slice of a tool result that was too large to inline.",
            schema(
                vec!["filename", "start", "end"],
                vec![
                    ("filename", string_prop("Bare filename (current session) or full relative path.")),
                    ("start", integer_prop("1-based start index, inclusive.")),
                    ("end", integer_prop("1-based end index, inclusive.")),
                ],
            ),
        ),
        ToolDescriptor::new(
            "search_large_output",
            "Search a spilled tool result by regex pattern, returning matching lines with context.",
            schema(
                vec!["filename", "pattern"],
                vec![
                    ("filename", string_prop("Bare filename (current session) or full relative path.")),
                    ("pattern", string_prop("Regex pattern to search for.")),
                    ("case_sensitive", boolean_prop("Defaults to false.")),
                    ("max_results", integer_prop("Maximum number of matches to return. Defaults to 20.")),
                ],
            ),
        ),
        ToolDescriptor::new(
            "query_large_output",
            "Query a spilled JSON tool result with a dot-path/array-index expression (e.g. `.items[0].name`).",
            schema(
                vec!["filename", "query"],
                vec![
                    ("filename", string_prop("Bare filename (current session) or full relative path.")),
                    ("query", string_prop("Dot-path query, e.g. `.items[0].name`.")),
                    ("compact", boolean_prop("Return compact JSON instead of pretty-printed. Defaults to false.")),
                ],
            ),
        ),
    ]
}

/// A tool call emitted by the assistant, in the order it appeared in the
/// message (spec §4.6: "executed in the order emitted").
#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments_json: String,
}

/// A custom tool registered by the embedder, invoked in-process rather than
/// routed to a tool server (spec §4.6 resolve step, second case).
#[async_trait::async_trait]
pub trait CustomTool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;
    async fn call(&self, arguments: serde_json::Value) -> Result<String, String>;
}

/// Everything the dispatcher needs to resolve a tool name for one turn: the
/// live cache entries built for this conversation, plus the custom tools
/// registered by the embedder.
pub struct DispatchContext<'a> {
    pub cache: &'a ToolServerCache,
    pub entries: &'a GetOrBuildResult,
    pub custom_tools: &'a HashMap<String, Arc<dyn CustomTool>>,
    pub large_output: &'a LargeOutputHandler,
    pub model: &'a str,
    pub session_id: &'a str,
}

pub struct ToolDispatcher {
    bus: Arc<EventBus>,
    tool_execution_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(bus: Arc<EventBus>, tool_execution_timeout: Duration) -> Self {
        Self {
            bus,
            tool_execution_timeout,
        }
    }

    /// Dispatches every call in `calls`, in order, returning one `Tool`
    /// message per call. A failure in one call never skips the rest (spec
    /// §4.6's cross-tool resilience rule). Checked for cancellation before
    /// each call (spec §4.9/§5); returns `Err(())` the moment cancellation is
    /// observed, with whatever results were already produced discarded by
    /// the caller in favor of aborting the conversation.
    pub async fn dispatch_turn(
        &self,
        ctx: &DispatchContext<'_>,
        calls: &[PendingToolCall],
        cancel_token: &tokio_util::sync::CancellationToken,
    ) -> Result<Vec<Message>, ()> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if cancel_token.is_cancelled() {
                return Err(());
            }
            results.push(self.dispatch_one(ctx, call).await);
        }
        Ok(results)
    }

    async fn dispatch_one(&self, ctx: &DispatchContext<'_>, call: &PendingToolCall) -> Message {
        let (event, correlation_id) = self.bus.emit_start(
            StartKind::ToolCall,
            "tool_call",
            EventPayload::ToolCallStart {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments_json.clone(),
            },
        );
        let _ = event;

        let (is_error, kind, text) = match self.execute(ctx, call).await {
            Ok(text) => (false, None, text),
            Err(err) => (true, Some(err.kind()), err.to_string()),
        };

        self.bus.emit_end(
            &correlation_id,
            EventPayload::ToolCallEnd {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                is_error,
                result: text.clone(),
            },
        );
        if is_error {
            if let Some(kind) = kind {
                self.bus.emit(EventPayload::ToolCallError {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    kind,
                    message: text.clone(),
                });
            }
        }

        let content = if is_error {
            text
        } else {
            ctx.large_output
                .maybe_spill_for_model(ctx.model, ctx.session_id, &call.name, &text, &self.bus)
                .unwrap_or(text)
        };

        Message::tool_result(call.id.clone(), call.name.clone(), content)
    }

    /// Resolves, validates, and invokes one call. Every failure mode is a
    /// `ToolDispatchError` folded into a tool-error result by the caller so
    /// the model can self-correct (spec §4.6 items 2-4) — this never
    /// propagates as a conversation-ending `Err`.
    async fn execute(&self, ctx: &DispatchContext<'_>, call: &PendingToolCall) -> Result<String, ToolDispatchError> {
        if call.name.trim().is_empty() {
            return Err(ToolDispatchError::EmptyName);
        }

        let arguments: serde_json::Value =
            serde_json::from_str(&call.arguments_json).map_err(|err| ToolDispatchError::ArgumentParse {
                tool: call.name.clone(),
                reason: format!("{err}. Arguments received: {}. Please retry with valid JSON arguments.", call.arguments_json),
            })?;

        if let Some(virtual_result) = self.try_virtual_tool(ctx, call, &arguments).await {
            return virtual_result;
        }

        if let Some(custom) = ctx.custom_tools.get(&call.name) {
            return match tokio::time::timeout(self.tool_execution_timeout, custom.call(arguments)).await {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(message)) => Err(ToolDispatchError::ToolReportedError(message)),
                Err(_) => Err(ToolDispatchError::Timeout {
                    tool: call.name.clone(),
                    timeout: self.tool_execution_timeout,
                }),
            };
        }

        let Some((server_name, entry)) = find_server_for_tool(ctx.entries, &call.name) else {
            return Err(ToolDispatchError::UnknownTool(format!(
                "Unknown tool `{}`. It is not registered or advertised by any connected server.",
                call.name,
            )));
        };

        self.call_on_server(ctx, server_name, entry, call, arguments).await
    }

    async fn call_on_server(
        &self,
        ctx: &DispatchContext<'_>,
        server_name: &str,
        entry: &Arc<CacheEntry>,
        call: &PendingToolCall,
        arguments: serde_json::Value,
    ) -> Result<String, ToolDispatchError> {
        let outcome = tokio::time::timeout(
            self.tool_execution_timeout,
            entry.handle.call_tool(&call.name, arguments.clone()),
        )
        .await;

        let result = match outcome {
            Ok(inner) => inner,
            Err(_) => {
                return Err(ToolDispatchError::Timeout {
                    tool: call.name.clone(),
                    timeout: self.tool_execution_timeout,
                })
            }
        };

        match result {
            Ok(outcome) if outcome.is_error => Err(ToolDispatchError::ToolReportedError(outcome.text())),
            Ok(outcome) => Ok(outcome.text()),
            Err(err) if err.is_broken_pipe() => {
                self.recover_broken_pipe(ctx, server_name, entry, call, arguments, err).await
            }
            Err(err) => Err(ToolDispatchError::OtherTransport {
                tool: call.name.clone(),
                message: err.to_string(),
            }),
        }
    }

    /// Spec §4.6 item 4: close the dead handle, reconnect via C2's
    /// `OnDemandConnect`, retry once with a fresh 30s timeout.
    async fn recover_broken_pipe(
        &self,
        ctx: &DispatchContext<'_>,
        server_name: &str,
        entry: &Arc<CacheEntry>,
        call: &PendingToolCall,
        arguments: serde_json::Value,
        original_error: ToolServerError,
    ) -> Result<String, ToolDispatchError> {
        self.bus.emit(EventPayload::BrokenPipeDetected {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            server_name: server_name.to_string(),
        });

        ctx.cache.invalidate(server_name, &entry.resolved_config);
        let fresh = match ctx.cache.on_demand_connect(server_name, &entry.resolved_config).await {
            Ok(fresh) => fresh,
            Err(err) => {
                self.bus.emit(EventPayload::ToolRecoveryFailed {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    server_name: server_name.to_string(),
                    message: err.to_string(),
                });
                return Err(ToolDispatchError::BrokenPipe(format!(
                    "Tool `{}` failed with a broken connection and reconnecting to `{server_name}` also failed: {err}. Original error: {original_error}",
                    call.name,
                )));
            }
        };

        match tokio::time::timeout(BROKEN_PIPE_RETRY_TIMEOUT, fresh.handle.call_tool(&call.name, arguments)).await {
            Ok(Ok(outcome)) => {
                self.bus.emit(EventPayload::ToolRecoverySuccess {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    server_name: server_name.to_string(),
                });
                if outcome.is_error {
                    Err(ToolDispatchError::ToolReportedError(outcome.text()))
                } else {
                    Ok(outcome.text())
                }
            }
            Ok(Err(err)) => {
                self.bus.emit(EventPayload::ToolRecoveryFailed {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    server_name: server_name.to_string(),
                    message: err.to_string(),
                });
                Err(ToolDispatchError::OtherTransport {
                    tool: call.name.clone(),
                    message: format!("failed again after reconnecting to `{server_name}`: {err}"),
                })
            }
            Err(_) => {
                self.bus.emit(EventPayload::ToolRecoveryFailed {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    server_name: server_name.to_string(),
                    message: "retry timed out".to_string(),
                });
                Err(ToolDispatchError::Timeout {
                    tool: format!("{} (after reconnecting to `{server_name}`)", call.name),
                    timeout: BROKEN_PIPE_RETRY_TIMEOUT,
                })
            }
        }
    }

    /// Resolves and runs one of the five virtual tools (spec §4.6/§4.7).
    /// Returns `None` if `call.name` isn't a virtual tool name.
    async fn try_virtual_tool(
        &self,
        ctx: &DispatchContext<'_>,
        call: &PendingToolCall,
        arguments: &serde_json::Value,
    ) -> Option<Result<String, ToolDispatchError>> {
        match call.name.as_str() {
            "get_prompt" => Some(self.virtual_get_prompt(ctx, arguments).await),
            "get_resource" => Some(self.virtual_get_resource(ctx, arguments).await),
            "read_large_output" => Some(self.virtual_read(ctx, arguments)),
            "search_large_output" => Some(self.virtual_search(ctx, arguments)),
            "query_large_output" => Some(self.virtual_query(ctx, arguments)),
            _ => None,
        }
    }

    async fn virtual_get_prompt(
        &self,
        ctx: &DispatchContext<'_>,
        arguments: &serde_json::Value,
    ) -> Result<String, ToolDispatchError> {
        let (Some(server), Some(name)) = (str_field(arguments, "server"), str_field(arguments, "name")) else {
            return Err(ToolDispatchError::ArgumentParse {
                tool: "get_prompt".to_string(),
                reason: "requires `server` and `name` string arguments.".to_string(),
            });
        };
        let Some(entry) = ctx.entries.entries.get(server) else {
            return Err(ToolDispatchError::UnknownTool(format!("No connected server named `{server}`.")));
        };
        entry
            .handle
            .get_prompt(name)
            .await
            .map_err(|err| ToolDispatchError::OtherTransport { tool: "get_prompt".to_string(), message: err.to_string() })
    }

    async fn virtual_get_resource(
        &self,
        ctx: &DispatchContext<'_>,
        arguments: &serde_json::Value,
    ) -> Result<String, ToolDispatchError> {
        let (Some(server), Some(uri)) = (str_field(arguments, "server"), str_field(arguments, "uri")) else {
            return Err(ToolDispatchError::ArgumentParse {
                tool: "get_resource".to_string(),
                reason: "requires `server` and `uri` string arguments.".to_string(),
            });
        };
        let Some(entry) = ctx.entries.entries.get(server) else {
            return Err(ToolDispatchError::UnknownTool(format!("No connected server named `{server}`.")));
        };
        entry
            .handle
            .get_resource(uri)
            .await
            .map_err(|err| ToolDispatchError::OtherTransport { tool: "get_resource".to_string(), message: err.to_string() })
    }

    fn virtual_read(&self, ctx: &DispatchContext<'_>, arguments: &serde_json::Value) -> Result<String, ToolDispatchError> {
        let Some(filename) = str_field(arguments, "filename") else {
            return Err(ToolDispatchError::ArgumentParse {
                tool: "read_large_output".to_string(),
                reason: "requires `filename`.".to_string(),
            });
        };
        let start = arguments.get("start").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
        let end = arguments.get("end").and_then(|v| v.as_u64()).unwrap_or(start as u64) as usize;
        ctx.large_output
            .read(ctx.session_id, filename, start, end)
            .map_err(|err| ToolDispatchError::OtherTransport { tool: "read_large_output".to_string(), message: err.to_string() })
    }

    fn virtual_search(&self, ctx: &DispatchContext<'_>, arguments: &serde_json::Value) -> Result<String, ToolDispatchError> {
        let (Some(filename), Some(pattern)) = (str_field(arguments, "filename"), str_field(arguments, "pattern")) else {
            return Err(ToolDispatchError::ArgumentParse {
                tool: "search_large_output".to_string(),
                reason: "requires `filename` and `pattern`.".to_string(),
            });
        };
        let case_sensitive = arguments.get("case_sensitive").and_then(|v| v.as_bool()).unwrap_or(false);
        let max_results = arguments.get("max_results").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
        ctx.large_output
            .search(ctx.session_id, filename, pattern, case_sensitive, max_results)
            .map_err(|err| ToolDispatchError::OtherTransport { tool: "search_large_output".to_string(), message: err.to_string() })
    }

    fn virtual_query(&self, ctx: &DispatchContext<'_>, arguments: &serde_json::Value) -> Result<String, ToolDispatchError> {
        let (Some(filename), Some(query)) = (str_field(arguments, "filename"), str_field(arguments, "query")) else {
            return Err(ToolDispatchError::ArgumentParse {
                tool: "query_large_output".to_string(),
                reason: "requires `filename` and `query`.".to_string(),
            });
        };
        let compact = arguments.get("compact").and_then(|v| v.as_bool()).unwrap_or(false);
        ctx.large_output
            .query(ctx.session_id, filename, query, compact)
            .map_err(|err| ToolDispatchError::OtherTransport { tool: "query_large_output".to_string(), message: err.to_string() })
    }
}

fn str_field<'a>(value: &'a serde_json::Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(|v| v.as_str())
}

fn find_server_for_tool<'a>(entries: &'a GetOrBuildResult, tool_name: &str) -> Option<(&'a str, &'a Arc<CacheEntry>)> {
    entries
        .entries
        .iter()
        .find(|(_, entry)| entry.tools.iter().any(|t| t.name == tool_name))
        .map(|(name, entry)| (name.as_str(), entry))
}
