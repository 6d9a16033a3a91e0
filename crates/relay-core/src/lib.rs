//! Provider-agnostic data model, LLM adapters/dispatch, and MCP tool-server
//! plumbing for the relay agent runtime.
//!
//! This crate owns everything `relay-agent` needs that isn't stateful: the
//! conversation data model (`message`), tool descriptors (`tool`), the five
//! `LLMAdapter` implementations plus the dispatch/fallback ladder (`llm`),
//! and the tool-server connection cache and client abstraction (`mcp`).

pub mod error;
pub mod hash;
pub mod llm;
pub mod mcp;
pub mod message;
pub mod tool;

pub use error::{ErrorKind, LLMError};
pub use llm::{GenerateOptions, LLMAdapter, Response};
pub use message::{Conversation, Message, Part, Role};
pub use tool::{FinishReason, ParameterProperty, ParametersSchema, ToolChoice, ToolDescriptor, UsageMetrics};
