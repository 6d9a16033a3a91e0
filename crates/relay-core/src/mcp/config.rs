//! Tool-server configuration: transport config, base+overlay resolution, and
//! the cache-key hash C2 keys connections by (spec §6/§4.2).
//!
//! `McpServerTransportConfig::start` is carried nearly verbatim from the
//! teacher's `querymt::mcp::config` — wire-protocol transport setup is
//! explicitly out of scope for this project, so `rmcp` stays the sole
//! collaborator that owns it.

use anyhow::Result;
use http::{header::AUTHORIZATION, HeaderValue};
use reqwest::header::HeaderMap;
use rmcp::{
    model::{ClientCapabilities, ClientInfo, Implementation, ProtocolVersion},
    service::{DynService, RunningService},
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        SseClientTransport, StreamableHttpClientTransport,
    },
    RoleClient, ServiceExt,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, process::Stdio};
use which::which;

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ToolServerFile {
    #[serde(default)]
    pub mcp: Vec<McpServerConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: McpServerTransportConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum McpServerTransportConfig {
    Http {
        url: String,
        token: Option<String>,
    },
    Sse {
        url: String,
        token: Option<String>,
    },
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
}

impl McpServerTransportConfig {
    pub async fn start(
        &self,
        client_impl: &Implementation,
    ) -> Result<RunningService<RoleClient, Box<dyn DynService<RoleClient>>>> {
        let client_info = ClientInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ClientCapabilities::default(),
            client_info: client_impl.clone(),
        };
        let client = match self {
            McpServerTransportConfig::Sse { url, token } => {
                let transport = match token {
                    Some(t) => {
                        let mut default_headers = HeaderMap::new();
                        default_headers.insert(
                            AUTHORIZATION,
                            HeaderValue::from_str(&format!("Bearer {t}"))?,
                        );

                        let client = reqwest::ClientBuilder::new()
                            .default_headers(default_headers)
                            .build()?;

                        SseClientTransport::start_with_client(
                            client,
                            SseClientConfig {
                                sse_endpoint: url.clone().into(),
                                ..Default::default()
                            },
                        )
                        .await?
                    }
                    None => SseClientTransport::start(url.as_str()).await?,
                };
                client_info.clone().into_dyn().serve(transport).await?
            }
            McpServerTransportConfig::Http { url, token } => {
                let transport = match token {
                    Some(t) => {
                        let mut default_headers = HeaderMap::new();
                        default_headers.insert(
                            AUTHORIZATION,
                            HeaderValue::from_str(&format!("Bearer {t}"))?,
                        );

                        let client = reqwest::ClientBuilder::new()
                            .default_headers(default_headers)
                            .build()?;

                        StreamableHttpClientTransport::with_client(
                            client,
                            StreamableHttpClientTransportConfig {
                                uri: url.clone().into(),
                                ..Default::default()
                            },
                        )
                    }
                    None => StreamableHttpClientTransport::from_uri(url.clone()),
                };
                client_info.clone().into_dyn().serve(transport).await?
            }
            McpServerTransportConfig::Stdio { command, .. }
                if !(which(command).is_ok() || Path::new(&command).exists()) =>
            {
                anyhow::bail!("Command not found: {}", command);
            }
            McpServerTransportConfig::Stdio {
                command,
                args,
                envs,
            } => {
                let mut cmd = tokio::process::Command::new(command);

                cmd.args(args)
                    .envs(envs)
                    .stderr(Stdio::inherit())
                    .stdout(Stdio::piped())
                    .stdin(Stdio::piped());
                let transport = rmcp::transport::child_process::TokioChildProcess::new(cmd)?;
                client_info.clone().into_dyn().serve(transport).await?
            }
        };
        log::trace!("Connected to server: {:#?}", client.peer_info());
        Ok(client)
    }
}

impl ToolServerFile {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    fn into_map(self) -> HashMap<String, McpServerTransportConfig> {
        self.mcp
            .into_iter()
            .map(|s| (s.name, s.transport))
            .collect()
    }
}

/// Resolves a base config plus an optional user-overlay config into the
/// `{server_name → resolved_config}` map C2 keys its cache on (spec §6: any
/// byte-level change to a server's resolved config rotates its cache key).
/// Conflict policy: user overrides base, per-server.
pub async fn resolve_servers(
    base_path: impl AsRef<Path>,
    overlay_path: Option<impl AsRef<Path>>,
) -> Result<HashMap<String, McpServerTransportConfig>> {
    let mut resolved = ToolServerFile::load(base_path).await?.into_map();
    if let Some(overlay_path) = overlay_path {
        if tokio::fs::try_exists(overlay_path.as_ref()).await.unwrap_or(false) {
            let overlay = ToolServerFile::load(overlay_path).await?.into_map();
            for (name, transport) in overlay {
                resolved.insert(name, transport);
            }
        }
    }
    Ok(resolved)
}

/// Deterministic cache key for `(server_name, resolved_config)` (spec §3/§4.2).
/// Serializes the resolved config to canonical JSON before hashing so field
/// order never affects the key.
pub fn cache_key(server_name: &str, resolved_config: &McpServerTransportConfig) -> crate::hash::RapidHash {
    let canonical = serde_json::to_string(resolved_config).unwrap_or_default();
    crate::hash::RapidHash::new(format!("{server_name}\0{canonical}").as_bytes())
}
