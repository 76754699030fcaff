//! Tool manager for multiple server connections.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{
    CONNECT_TIMEOUT, HttpToolServer, ServerInfo, ServerTransport, StdioToolServer, ToolDefinition,
    ToolConfigError, ToolDescriptor, ToolError, ToolOutput, ToolServer, ToolServerSpec,
    ToolServersConfig, parse_tool_name,
};

/// A server that could not be started.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerFailure {
    pub server: String,
    pub message: String,
}

struct ConnectedServer {
    server: Arc<dyn ToolServer>,
    info: ServerInfo,
    tools: Vec<ToolDefinition>,
    call_timeout: Duration,
    call_lock: Mutex<()>,
}

impl ConnectedServer {
    fn has_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t.name == tool)
    }
}

#[derive(Default)]
pub struct ToolManager {
    servers: DashMap<String, Arc<ConnectedServer>>,
    failures: DashMap<String, ServerFailure>,
}

impl std::fmt::Debug for ToolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolManager")
            .field("servers", &self.server_names())
            .field("failures", &self.failures.len())
            .finish()
    }
}

fn build_server(spec: &ToolServerSpec) -> Arc<dyn ToolServer> {
    match &spec.transport {
        ServerTransport::Stdio {
            command,
            args,
            env,
            cwd,
        } => Arc::new(
            StdioToolServer::new(&spec.name, command)
                .with_args(args.clone())
                .with_env(env.clone())
                .with_cwd(cwd.clone())
                .with_concurrent_calls(spec.concurrent),
        ),
        ServerTransport::Http { url, headers } => Arc::new(
            HttpToolServer::new(&spec.name, url)
                .with_headers(headers.clone())
                .with_concurrent_calls(spec.concurrent),
        ),
    }
}

impl ToolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every enabled server concurrently.
    ///
    /// A server that fails its handshake is recorded in
    /// [`startup_failures`](Self::startup_failures) and never aborts startup of the others.
    pub async fn start(specs: Vec<ToolServerSpec>) -> Self {
        let manager = Self::new();
        let pending = specs.iter().filter_map(|spec| {
            if !spec.enabled {
                tracing::debug!(server = %spec.name, "tool server disabled");
                return None;
            }
            Some(manager.register(build_server(spec), spec.call_timeout))
        });

        let results = futures::future::join_all(pending).await;
        let connected = results.iter().filter(|r| r.is_ok()).count();
        tracing::info!(
            connected,
            failed = results.len() - connected,
            tools = manager.tool_count(),
            "tool servers started"
        );
        manager
    }

    /// Resolve a loaded configuration against the environment and start it.
    pub async fn from_config(config: &ToolServersConfig) -> Result<Self, ToolConfigError> {
        Ok(Self::start(config.resolve()?).await)
    }

    /// Connect a server and register its tools.
    pub async fn register(
        &self,
        server: Arc<dyn ToolServer>,
        call_timeout: Duration,
    ) -> Result<usize, ToolError> {
        let name = server.name().to_string();
        match self.handshake(server.as_ref()).await {
            Ok((info, tools)) => {
                let count = tools.len();
                tracing::info!(server = %name, version = %info.version, tools = count, "tool server connected");
                self.failures.remove(&name);
                self.servers.insert(
                    name,
                    Arc::new(ConnectedServer {
                        server,
                        info,
                        tools,
                        call_timeout,
                        call_lock: Mutex::new(()),
                    }),
                );
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "tool server failed to start");
                self.failures.insert(
                    name.clone(),
                    ServerFailure {
                        server: name,
                        message: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        server: &dyn ToolServer,
    ) -> Result<(ServerInfo, Vec<ToolDefinition>), ToolError> {
        let name = server.name();
        let info = timeout(CONNECT_TIMEOUT, server.connect())
            .await
            .map_err(|_| {
                ToolError::unreachable(name, format!("handshake timed out after {CONNECT_TIMEOUT:?}"))
            })??;
        let tools = timeout(CONNECT_TIMEOUT, server.list_tools())
            .await
            .map_err(|_| {
                ToolError::unreachable(name, format!("tool listing timed out after {CONNECT_TIMEOUT:?}"))
            })??;
        Ok((info, tools))
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn server_info(&self, server: &str) -> Option<ServerInfo> {
        self.servers.get(server).map(|e| e.info.clone())
    }

    pub fn startup_failures(&self) -> Vec<ServerFailure> {
        let mut failures: Vec<ServerFailure> =
            self.failures.iter().map(|e| e.value().clone()).collect();
        failures.sort_by(|a, b| a.server.cmp(&b.server));
        failures
    }

    pub fn tool_count(&self) -> usize {
        self.servers.iter().map(|e| e.tools.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tool_count() == 0
    }

    /// All tools across connected servers, sorted by qualified name.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .servers
            .iter()
            .flat_map(|entry| {
                let server = entry.key().clone();
                entry
                    .tools
                    .iter()
                    .cloned()
                    .map(move |t| ToolDescriptor::new(&server, t))
                    .collect::<Vec<_>>()
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Invoke a tool by qualified name.
    ///
    /// Calls to servers that do not support concurrent calls are serialized.
    /// A result flagged as an error by the server becomes [`ToolError::Failed`].
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        let (server_name, tool) = parse_tool_name(name).ok_or_else(|| ToolError::not_found(name))?;

        let Some(entry) = self.servers.get(server_name).map(|e| Arc::clone(e.value())) else {
            return Err(match self.failures.get(server_name) {
                Some(failure) => ToolError::unreachable(server_name, failure.message.clone()),
                None => ToolError::not_found(name),
            });
        };
        if !entry.has_tool(tool) {
            return Err(ToolError::not_found(name));
        }

        let _guard = if entry.server.supports_concurrent_calls() {
            None
        } else {
            Some(entry.call_lock.lock().await)
        };

        tracing::debug!(server = %server_name, tool = %tool, "invoking tool");
        let output = timeout(entry.call_timeout, entry.server.call_tool(tool, arguments))
            .await
            .map_err(|_| {
                ToolError::unreachable(
                    server_name,
                    format!("call to '{tool}' timed out after {:?}", entry.call_timeout),
                )
            })??;

        if output.is_error {
            return Err(ToolError::failed(name, output.to_text()));
        }
        Ok(output)
    }

    pub async fn close_all(&self) {
        let entries: Vec<(String, Arc<ConnectedServer>)> = self
            .servers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        self.servers.clear();

        for (name, entry) in entries {
            if let Err(e) = entry.server.close().await {
                tracing::warn!(server = %name, error = %e, "failed to close tool server");
            }
        }
    }
}
