//! Tool-server connection cache and client abstraction (C2/C3, spec §4.2/§4.3).

pub mod cache;
pub mod client;
pub mod config;

pub use cache::{CacheEntry, CacheError, GetOrBuildResult, ServerSelector, ToolServerCache};
pub use client::{ToolCallOutcome, ToolServerError, ToolServerHandle};
pub use config::{cache_key, resolve_servers, McpServerConfig, McpServerTransportConfig};
