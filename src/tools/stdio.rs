//! Stdio transport: a tool server running as a child process, driven by rmcp.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{ServerInfo, ToolDefinition, ToolError, ToolOutput, ToolServer};
#[cfg(feature = "mcp")]
use super::ToolContent;

#[cfg(feature = "mcp")]
use rmcp::{
    RoleClient,
    model::CallToolRequestParam,
    service::{RunningService, ServiceError, ServiceExt},
    transport::{ConfigureCommandExt, TokioChildProcess},
};

#[cfg(feature = "mcp")]
type RunningClient = RunningService<RoleClient, ()>;
#[cfg(not(feature = "mcp"))]
type RunningClient = ();

pub struct StdioToolServer {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    concurrent: bool,
    #[cfg_attr(not(feature = "mcp"), allow(dead_code))]
    service: RwLock<Option<RunningClient>>,
}

impl std::fmt::Debug for StdioToolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioToolServer")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("args", &self.args)
            .finish()
    }
}

impl StdioToolServer {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            concurrent: false,
            service: RwLock::new(None),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: Option<String>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn with_concurrent_calls(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    #[cfg(not(feature = "mcp"))]
    fn disabled(&self) -> ToolError {
        ToolError::unreachable(&self.name, "mcp feature not enabled")
    }
}

#[cfg(feature = "mcp")]
fn map_service_error(server: &str, tool: Option<&str>, e: ServiceError) -> ToolError {
    match (e, tool) {
        (ServiceError::McpError(data), Some(tool)) => ToolError::failed(
            tool,
            format!("JSON-RPC error {}: {}", data.code.0, data.message),
        ),
        (e, _) => ToolError::unreachable(server, e.to_string()),
    }
}

#[cfg(feature = "mcp")]
fn convert_content(content: rmcp::model::Content) -> ToolContent {
    use rmcp::model::{RawContent, ResourceContents};

    match content.raw {
        RawContent::Text(t) => ToolContent::Text { text: t.text },
        RawContent::Image(i) => ToolContent::Image {
            data: i.data,
            mime_type: i.mime_type,
        },
        RawContent::Resource(r) => match r.resource {
            ResourceContents::TextResourceContents {
                uri,
                mime_type,
                text,
                ..
            } => ToolContent::Resource {
                uri,
                text: Some(text),
                mime_type,
            },
            ResourceContents::BlobResourceContents { uri, mime_type, .. } => {
                ToolContent::Resource {
                    uri,
                    text: None,
                    mime_type,
                }
            }
        },
        RawContent::Audio(_) => ToolContent::text("[audio]"),
        RawContent::ResourceLink(r) => ToolContent::Resource {
            uri: r.uri,
            text: None,
            mime_type: r.mime_type,
        },
    }
}

#[cfg(feature = "mcp")]
#[async_trait]
impl ToolServer for StdioToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_concurrent_calls(&self) -> bool {
        self.concurrent
    }

    async fn connect(&self) -> Result<ServerInfo, ToolError> {
        let transport =
            TokioChildProcess::new(tokio::process::Command::new(&self.command).configure(|cmd| {
                cmd.args(&self.args);
                for (key, value) in &self.env {
                    cmd.env(key, value);
                }
                if let Some(cwd) = &self.cwd {
                    cmd.current_dir(cwd);
                }
            }))
            .map_err(|e| {
                ToolError::unreachable(&self.name, format!("failed to spawn '{}': {e}", self.command))
            })?;

        let service: RunningClient = ().serve(transport).await.map_err(|e| {
            ToolError::unreachable(&self.name, format!("handshake failed: {e}"))
        })?;

        let info = service
            .peer_info()
            .map(|info| ServerInfo {
                name: info.server_info.name.to_string(),
                version: info.server_info.version.to_string(),
                protocol_version: info.protocol_version.to_string(),
            })
            .unwrap_or_else(|| ServerInfo {
                name: self.name.clone(),
                ..Default::default()
            });

        if !super::SUPPORTED_PROTOCOL_VERSIONS.contains(&info.protocol_version.as_str()) {
            tracing::warn!(
                server = %self.name,
                server_version = %info.protocol_version,
                supported = ?super::SUPPORTED_PROTOCOL_VERSIONS,
                "protocol version mismatch"
            );
        }

        *self.service.write().await = Some(service);
        Ok(info)
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| ToolError::unreachable(&self.name, "not connected"))?;

        let result = service
            .list_tools(Default::default())
            .await
            .map_err(|e| map_service_error(&self.name, None, e))?;

        Ok(result
            .tools
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()).unwrap_or_default(),
                input_schema: Value::Object((*t.input_schema).clone()),
            })
            .collect())
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| ToolError::unreachable(&self.name, "not connected"))?;

        let result = service
            .call_tool(CallToolRequestParam {
                name: tool.to_string().into(),
                arguments: arguments.as_object().cloned(),
            })
            .await
            .map_err(|e| map_service_error(&self.name, Some(tool), e))?;

        Ok(ToolOutput {
            content: result.content.into_iter().map(convert_content).collect(),
            is_error: result.is_error.unwrap_or(false),
        })
    }

    async fn close(&self) -> Result<(), ToolError> {
        if let Some(service) = self.service.write().await.take() {
            service
                .cancel()
                .await
                .map_err(|e| ToolError::unreachable(&self.name, format!("failed to stop: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(not(feature = "mcp"))]
#[async_trait]
impl ToolServer for StdioToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_concurrent_calls(&self) -> bool {
        self.concurrent
    }

    async fn connect(&self) -> Result<ServerInfo, ToolError> {
        Err(self.disabled())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        Err(self.disabled())
    }

    async fn call_tool(&self, _tool: &str, _arguments: Value) -> Result<ToolOutput, ToolError> {
        Err(self.disabled())
    }
}
