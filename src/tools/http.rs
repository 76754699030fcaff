//! Streamable HTTP transport: JSON-RPC requests over HTTP POST.
//!
//! Responses may come back either as a JSON body or as a server-sent event
//! stream carrying the JSON-RPC message in `data:` lines.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{
    PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS, ServerInfo, ToolDefinition, ToolError,
    ToolOutput, ToolServer,
};

const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug)]
enum RpcError {
    Transport(String),
    Remote { code: i64, message: String },
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(message) => f.write_str(message),
            Self::Remote { code, message } => write!(f, "JSON-RPC error {code}: {message}"),
        }
    }
}

pub struct HttpToolServer {
    name: String,
    url: String,
    headers: HashMap<String, String>,
    http: reqwest::Client,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    concurrent: bool,
}

impl std::fmt::Debug for HttpToolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpToolServer")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish()
    }
}

impl HttpToolServer {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            headers: HashMap::new(),
            http: reqwest::Client::new(),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
            concurrent: false,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_concurrent_calls(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    fn session(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn remember_session(&self, response: &reqwest::Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        }
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, RpcError> {
        let mut req = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(body);

        if let Some(session) = self.session() {
            req = req.header(SESSION_HEADER, session);
        }
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let response = req
            .send()
            .await
            .map_err(|e| RpcError::Transport(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(RpcError::Transport(format!("HTTP {status}: {text}")));
        }

        self.remember_session(&response);
        Ok(response)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let response = self.post(&body).await?;

        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let text = response
            .text()
            .await
            .map_err(|e| RpcError::Transport(format!("failed to read response: {e}")))?;

        let message = if is_sse {
            text.lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
                .find(|msg| msg.get("id").and_then(Value::as_u64) == Some(id))
                .ok_or_else(|| RpcError::Transport("no response in event stream".into()))?
        } else {
            serde_json::from_str::<Value>(&text)
                .map_err(|e| RpcError::Transport(format!("invalid JSON-RPC response: {e}")))?
        };

        if let Some(error) = message.get("error") {
            return Err(RpcError::Remote {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str) -> Result<(), RpcError> {
        let body = json!({ "jsonrpc": "2.0", "method": method });
        self.post(&body).await.map(|_| ())
    }

    fn unreachable(&self, e: RpcError) -> ToolError {
        ToolError::unreachable(&self.name, e.to_string())
    }
}

#[async_trait]
impl ToolServer for HttpToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_concurrent_calls(&self) -> bool {
        self.concurrent
    }

    async fn connect(&self) -> Result<ServerInfo, ToolError> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await
            .map_err(|e| self.unreachable(e))?;

        let info = ServerInfo {
            name: result["serverInfo"]["name"]
                .as_str()
                .unwrap_or(&self.name)
                .to_string(),
            version: result["serverInfo"]["version"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            protocol_version: result["protocolVersion"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        };

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&info.protocol_version.as_str()) {
            tracing::warn!(
                server = %self.name,
                server_version = %info.protocol_version,
                supported = ?SUPPORTED_PROTOCOL_VERSIONS,
                "protocol version mismatch"
            );
        }

        self.notify("notifications/initialized")
            .await
            .map_err(|e| self.unreachable(e))?;
        Ok(info)
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self
                .request("tools/list", params)
                .await
                .map_err(|e| self.unreachable(e))?;

            let page: Vec<ToolDefinition> =
                serde_json::from_value(result["tools"].clone()).map_err(|e| {
                    ToolError::unreachable(&self.name, format!("invalid tools/list result: {e}"))
                })?;
            tools.extend(page);

            match result["nextCursor"].as_str() {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let result = self
            .request("tools/call", json!({ "name": tool, "arguments": arguments }))
            .await
            .map_err(|e| match e {
                RpcError::Remote { .. } => ToolError::failed(tool, e.to_string()),
                RpcError::Transport(_) => self.unreachable(e),
            })?;

        serde_json::from_value(result)
            .map_err(|e| ToolError::failed(tool, format!("invalid tools/call result: {e}")))
    }
}
