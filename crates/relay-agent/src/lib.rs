//! Stateful half of the agent runtime: event bus, tool dispatch, large-output
//! handling, system-prompt assembly, and the conversation driver.
//!
//! The provider-agnostic data model and LLM/MCP plumbing live in
//! `relay_core`; this crate owns everything that carries per-conversation
//! state.

pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod event_bus;
pub mod event_sink;
pub mod events;
pub mod large_output;
pub mod smart_routing;
pub mod system_prompt;

pub use config::RuntimeConfig;
pub use dispatcher::{virtual_tool_descriptors, CustomTool, DispatchContext, PendingToolCall, ToolDispatcher};
pub use driver::{AskContext, ConversationDriver, DriverConfig};
pub use error::AgentError;
pub use event_bus::{EventBus, EventBusObserver, StartKind};
pub use event_sink::{fanout, ConsoleTracer, NoopTracer, RemoteTracer, Tracer};
pub use events::{Event, EventPayload};
pub use large_output::{LargeOutputError, LargeOutputHandler};
pub use smart_routing::SmartRoutingConfig;
pub use system_prompt::{build_system_prompt, AgentMode, DiscoveryToggles};
