//! Tool-server connection cache (C2, spec §4.2).
//!
//! Deliberately NOT grounded on the teacher's `mcp::cache::RegistryCache` —
//! that type is a disk-backed TTL cache for the unrelated MCP *package
//! registry* lookup, not this spec's live-connection cache. This is a fresh,
//! pure in-memory `Arc<RwLock<HashMap<...>>>` keyed on
//! `mcp::config::cache_key`, with at-most-one-build-per-key enforced by a
//! per-key `tokio::sync::Mutex`, in the teacher's lock-around-shared-state
//! idiom from `event_bus.rs`.

use super::client::{ToolServerError, ToolServerHandle};
use super::config::{cache_key, McpServerTransportConfig};
use crate::hash::RapidHash;
use crate::tool::ToolDescriptor;
use parking_lot::RwLock as SyncRwLock;
use rmcp::model::Implementation;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("tool-server config is invalid: {0}")]
    ConfigInvalid(String),
    #[error("no usable tool servers and cache_only was requested")]
    NoUsableServers,
}

/// One live, discovered server (spec §3's cache entry). `valid_flag` is
/// cleared by `close` or by broken-pipe recovery replacing the handle; a
/// cleared entry is treated as a cache miss on the next lookup.
pub struct CacheEntry {
    pub server_name: String,
    pub resolved_config: McpServerTransportConfig,
    pub handle: Arc<ToolServerHandle>,
    pub tools: Vec<ToolDescriptor>,
    pub prompts: Vec<String>,
    pub resources: Vec<String>,
    pub derived_system_prompt_fragment: String,
    pub created_at: Instant,
    valid_flag: AtomicBool,
}

impl CacheEntry {
    pub fn is_valid(&self) -> bool {
        self.valid_flag.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid_flag.store(false, Ordering::Release);
    }
}

fn derive_system_prompt_fragment(server_name: &str, tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return format!("Server `{server_name}` exposes no tools.");
    }
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    format!("Server `{server_name}` exposes: {}.", names.join(", "))
}

/// Outcome of a selector-scoped build pass: the servers that came up plus
/// the servers that didn't, with each failure's message (spec §4.2 item 2:
/// partial success is acceptable, non-fatal per-server failures are events).
pub struct GetOrBuildResult {
    pub entries: HashMap<String, Arc<CacheEntry>>,
    pub failures: Vec<(String, String)>,
}

impl GetOrBuildResult {
    pub fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        self.entries.values().flat_map(|e| e.tools.clone()).collect()
    }

    /// Maps a tool name to the server that owns it. Conflicts (two servers
    /// exposing the same name) resolve to whichever server appears first in
    /// the iteration the caller built `entries` with; callers that care
    /// about deterministic ordering should pass servers pre-sorted.
    pub fn tool_to_server(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for (server_name, entry) in &self.entries {
            for tool in &entry.tools {
                map.entry(tool.name.clone())
                    .or_insert_with(|| server_name.clone());
            }
        }
        map
    }

    pub fn system_prompt_fragment(&self) -> String {
        self.entries
            .values()
            .map(|e| e.derived_system_prompt_fragment.clone())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Comma-separated or "all"/"" server selector (spec §4.2).
pub enum ServerSelector {
    All,
    Named(Vec<String>),
}

impl ServerSelector {
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") {
            ServerSelector::All
        } else {
            ServerSelector::Named(raw.split(',').map(|s| s.trim().to_string()).collect())
        }
    }

    fn matches(&self, server_name: &str) -> bool {
        match self {
            ServerSelector::All => true,
            ServerSelector::Named(names) => names.iter().any(|n| n == server_name),
        }
    }
}

pub struct ToolServerCache {
    entries: SyncRwLock<HashMap<RapidHash, Arc<CacheEntry>>>,
    build_locks: SyncRwLock<HashMap<RapidHash, Arc<AsyncMutex<()>>>>,
    client_impl: Implementation,
}

impl ToolServerCache {
    pub fn new(client_impl: Implementation) -> Self {
        Self {
            entries: SyncRwLock::new(HashMap::new()),
            build_locks: SyncRwLock::new(HashMap::new()),
            client_impl,
        }
    }

    fn build_lock_for(&self, key: RapidHash) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.build_locks.read().get(&key) {
            return lock.clone();
        }
        self.build_locks
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Get-or-build for every server matching `selector` in `resolved`
    /// (spec §4.2). Concurrent callers for the same key block on the first
    /// build rather than building twice (at-most-one-build-per-key).
    pub async fn get_or_build(
        &self,
        selector: &ServerSelector,
        resolved: &HashMap<String, McpServerTransportConfig>,
        cache_only: bool,
    ) -> Result<GetOrBuildResult, CacheError> {
        let mut entries = HashMap::new();
        let mut failures = Vec::new();

        for (server_name, config) in resolved {
            if !selector.matches(server_name) {
                continue;
            }
            let key = cache_key(server_name, config);

            if let Some(entry) = self.entries.read().get(&key).cloned() {
                if entry.is_valid() {
                    entries.insert(server_name.clone(), entry);
                    continue;
                }
            }

            if cache_only {
                continue;
            }

            let build_lock = self.build_lock_for(key);
            let _guard = build_lock.lock().await;

            if let Some(entry) = self.entries.read().get(&key).cloned() {
                if entry.is_valid() {
                    entries.insert(server_name.clone(), entry);
                    continue;
                }
            }

            match self.build_entry(server_name, config).await {
                Ok(entry) => {
                    let entry = Arc::new(entry);
                    self.entries.write().insert(key, entry.clone());
                    entries.insert(server_name.clone(), entry);
                }
                Err(err) => failures.push((server_name.clone(), err.to_string())),
            }
        }

        if entries.is_empty() && cache_only {
            return Err(CacheError::NoUsableServers);
        }

        Ok(GetOrBuildResult { entries, failures })
    }

    /// Cache miss inside a live conversation (spec §4.2: `OnDemandConnect`).
    pub async fn on_demand_connect(
        &self,
        server_name: &str,
        config: &McpServerTransportConfig,
    ) -> Result<Arc<CacheEntry>, ToolServerError> {
        let key = cache_key(server_name, config);
        let build_lock = self.build_lock_for(key);
        let _guard = build_lock.lock().await;

        if let Some(entry) = self.entries.read().get(&key).cloned() {
            if entry.is_valid() {
                return Ok(entry);
            }
        }

        let entry = Arc::new(
            self.build_entry(server_name, config)
                .await
                .map_err(|e| ToolServerError::TransportError(e.to_string()))?,
        );
        self.entries.write().insert(key, entry.clone());
        Ok(entry)
    }

    /// Invalidates the cached entry for `server_name`/`config` (spec §4.2
    /// item 5) so broken-pipe recovery forces a rebuild on the next call.
    pub fn invalidate(&self, server_name: &str, config: &McpServerTransportConfig) {
        let key = cache_key(server_name, config);
        if let Some(entry) = self.entries.read().get(&key) {
            entry.invalidate();
        }
    }

    async fn build_entry(
        &self,
        server_name: &str,
        config: &McpServerTransportConfig,
    ) -> Result<CacheEntry, ToolServerError> {
        let handle = ToolServerHandle::connect(config, &self.client_impl).await?;
        let tools = handle.list_tools().await?;
        let prompts = handle.list_prompts().await.unwrap_or_default();
        let resources = handle.list_resources().await.unwrap_or_default();
        let derived_system_prompt_fragment = derive_system_prompt_fragment(server_name, &tools);

        Ok(CacheEntry {
            server_name: server_name.to_string(),
            resolved_config: config.clone(),
            handle: Arc::new(handle),
            tools,
            prompts,
            resources,
            derived_system_prompt_fragment,
            created_at: Instant::now(),
            valid_flag: AtomicBool::new(true),
        })
    }
}
