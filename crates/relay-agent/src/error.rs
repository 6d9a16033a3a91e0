//! Top-level error type for the agent runtime (spec §7).
//!
//! Unlike `relay_core`'s `LLMError`/`ToolServerError`/`CacheError`, which are
//! absorbed internally (by C5's fallback ladder, or rewritten into tool
//! result parts by C6), `AgentError` is what the conversation driver (C9)
//! surfaces when nothing further can be done: an unrecoverable LLM failure,
//! a fatal cache-construction error, or caller-observed cancellation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM call failed after exhausting all fallbacks: {0}")]
    Llm(#[from] relay_core::LLMError),

    #[error("tool-server cache construction failed: {0}")]
    Cache(#[from] relay_core::mcp::CacheError),

    #[error("conversation cancelled")]
    Cancelled,

    #[error("structured output did not match the requested schema after {attempts} attempts: {message}")]
    SchemaCoercionFailed { attempts: usize, message: String },
}
