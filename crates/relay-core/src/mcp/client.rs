//! Tool-server client abstraction (C3, spec §4.3): one uniform contract over
//! stdio/HTTP/SSE transports, backed by `rmcp`'s `RunningService`.

use super::config::McpServerTransportConfig;
use crate::error::is_broken_pipe_text;
use crate::tool::{schema_from_json, ParametersSchema, ToolDescriptor};
use rmcp::model::{
    CallToolRequestParam, GetPromptRequestParam, Implementation, ReadResourceRequestParam,
};
use rmcp::service::{DynService, RunningService};
use rmcp::RoleClient;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolServerError {
    #[error("transport unreachable: {0}")]
    TransportUnreachable(String),
    #[error("handshake failure: {0}")]
    HandshakeFailure(String),
    #[error("transport error: {0}")]
    TransportError(String),
    /// Distinguished per spec §4.3: any error string containing one of the
    /// dead-pipe tokens. The handle backing this client must be treated as
    /// dead and rebuilt, never retried in place.
    #[error("broken pipe: {0}")]
    BrokenPipe(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl ToolServerError {
    fn from_transport(err: impl std::fmt::Display) -> Self {
        let text = err.to_string();
        if is_broken_pipe_text(&text) {
            ToolServerError::BrokenPipe(text)
        } else {
            ToolServerError::TransportError(text)
        }
    }

    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, ToolServerError::BrokenPipe(_))
    }
}

/// Result of a `CallTool` invocation, normalized from the wire shape.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub is_error: bool,
    pub contents: Vec<String>,
}

impl ToolCallOutcome {
    pub fn text(&self) -> String {
        self.contents.join("\n")
    }
}

/// Live handle to one connected tool server, wrapping the `rmcp` service.
pub struct ToolServerHandle {
    service: RunningService<RoleClient, Box<dyn DynService<RoleClient>>>,
}

impl ToolServerHandle {
    pub async fn connect(
        config: &McpServerTransportConfig,
        client_impl: &Implementation,
    ) -> Result<Self, ToolServerError> {
        let service = config
            .start(client_impl)
            .await
            .map_err(|e| ToolServerError::TransportUnreachable(e.to_string()))?;
        Ok(Self { service })
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolServerError> {
        let result = self
            .service
            .list_all_tools()
            .await
            .map_err(ToolServerError::from_transport)?;
        Ok(result
            .into_iter()
            .map(|t| {
                let mut schema_map: Map<String, Value> = Map::new();
                for (k, v) in t.input_schema.as_ref().iter() {
                    schema_map.insert(k.clone(), v.clone());
                }
                let raw = Value::Object(schema_map);
                let (schema, raw_schema): (ParametersSchema, Option<Value>) = schema_from_json(&raw);
                ToolDescriptor {
                    name: t.name.into_owned(),
                    description: t.description.map(|d| d.into_owned()).unwrap_or_default(),
                    parameters: schema,
                    raw_schema: raw_schema.or(Some(raw)),
                }
            })
            .collect())
    }

    pub async fn list_prompts(&self) -> Result<Vec<String>, ToolServerError> {
        let result = self
            .service
            .list_all_prompts()
            .await
            .map_err(ToolServerError::from_transport)?;
        Ok(result.into_iter().map(|p| p.name).collect())
    }

    pub async fn list_resources(&self) -> Result<Vec<String>, ToolServerError> {
        let result = self
            .service
            .list_all_resources()
            .await
            .map_err(ToolServerError::from_transport)?;
        Ok(result.into_iter().map(|r| r.uri).collect())
    }

    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
    ) -> Result<ToolCallOutcome, ToolServerError> {
        let arguments = match args {
            Value::Object(map) => Some(map),
            _ => None,
        };
        let result = self
            .service
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments,
            })
            .await
            .map_err(ToolServerError::from_transport)?;

        let contents: Vec<String> = result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect();
        let is_error = result.is_error.unwrap_or(false);

        if is_error {
            let joined = contents.join("\n");
            if is_broken_pipe_text(&joined) {
                return Err(ToolServerError::BrokenPipe(joined));
            }
        }

        Ok(ToolCallOutcome { is_error, contents })
    }

    pub async fn get_prompt(&self, name: &str) -> Result<String, ToolServerError> {
        let result = self
            .service
            .get_prompt(GetPromptRequestParam {
                name: name.to_string(),
                arguments: None,
            })
            .await
            .map_err(|e| {
                let text = e.to_string();
                if text.contains("not found") {
                    ToolServerError::NotFound(text)
                } else {
                    ToolServerError::from_transport(text)
                }
            })?;
        Ok(result
            .messages
            .iter()
            .filter_map(|m| m.content.as_text().map(|t| t.text.clone()))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    pub async fn get_resource(&self, uri: &str) -> Result<String, ToolServerError> {
        let result = self
            .service
            .read_resource(ReadResourceRequestParam {
                uri: uri.to_string(),
            })
            .await
            .map_err(|e| {
                let text = e.to_string();
                if text.contains("not found") {
                    ToolServerError::NotFound(text)
                } else {
                    ToolServerError::from_transport(text)
                }
            })?;
        Ok(result
            .contents
            .iter()
            .map(|c| match c.as_text() {
                Some(t) => t.text.clone(),
                None => {
                    let mime = serde_json::to_value(c)
                        .ok()
                        .and_then(|v| v.get("mimeType").and_then(|m| m.as_str().map(str::to_string)))
                        .unwrap_or_else(|| "application/octet-stream".to_string());
                    format!("[Binary data: {mime}]")
                }
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Never raises (spec §4.3).
    pub async fn close(self) {
        let _ = self.service.cancel().await;
    }
}
