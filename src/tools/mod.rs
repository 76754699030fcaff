//! External tool servers.
//!
//! Tool servers are independent processes or services speaking the Model
//! Context Protocol. Each transport is a [`ToolServer`] adapter; the
//! [`ToolManager`] connects to every configured server and exposes their tools
//! under qualified names of the form `server__tool`.

pub mod config;
pub mod http;
pub mod manager;
pub mod stdio;

pub use config::{ServerTransport, ToolConfigError, ToolServerEntry, ToolServerSpec, ToolServersConfig};
pub use http::HttpToolServer;
pub use manager::{ServerFailure, ToolManager};
pub use stdio::StdioToolServer;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub(crate) const PROTOCOL_VERSION: &str = "2025-03-26";
pub(crate) const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const CALL_TIMEOUT: Duration = Duration::from_secs(60);

const NAME_SEPARATOR: &str = "__";

/// Split a qualified name (`server__tool`) into `(server, tool)`.
pub fn parse_tool_name(name: &str) -> Option<(&str, &str)> {
    let (server, tool) = name.split_once(NAME_SEPARATOR)?;
    (!server.is_empty() && !tool.is_empty()).then_some((server, tool))
}

pub fn make_tool_name(server: &str, tool: &str) -> String {
    format!("{server}{NAME_SEPARATOR}{tool}")
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub protocol_version: String,
}

/// A tool as reported by its server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

/// A tool as offered to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Qualified name, `server__tool`.
    pub name: String,
    pub server: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl ToolDescriptor {
    pub fn new(server: &str, tool: ToolDefinition) -> Self {
        Self {
            name: make_tool_name(server, &tool.name),
            server: server.to_string(),
            description: tool.description,
            input_schema: tool.input_schema,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType", alias = "mime_type")]
        mime_type: String,
    },
    Resource {
        uri: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default, rename = "mimeType", alias = "mime_type")]
        mime_type: Option<String>,
    },
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Resource { text, .. } => text.as_deref(),
            Self::Image { .. } => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: false,
        }
    }

    pub fn to_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        for content in &self.content {
            match content {
                ToolContent::Image { mime_type, .. } => parts.push(format!("[image: {mime_type}]")),
                other => parts.extend(other.as_text().map(str::to_string)),
            }
        }
        parts.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {name}")]
    NotFound { name: String },

    #[error("tool server '{server}' is unreachable: {message}")]
    Unreachable { server: String, message: String },

    #[error("tool '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

impl ToolError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn unreachable(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unreachable {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// One connected tool server, independent of transport.
#[async_trait]
pub trait ToolServer: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the server tolerates overlapping `call_tool` requests.
    fn supports_concurrent_calls(&self) -> bool {
        false
    }

    /// Perform the protocol handshake.
    async fn connect(&self) -> Result<ServerInfo, ToolError>;

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError>;

    /// Call a tool by its server-local name.
    async fn call_tool(&self, tool: &str, arguments: serde_json::Value)
    -> Result<ToolOutput, ToolError>;

    async fn close(&self) -> Result<(), ToolError> {
        Ok(())
    }
}
