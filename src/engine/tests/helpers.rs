//! Scripted collaborators for engine tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::events::{AgentEvent, EventStream};
use crate::execution::{EnvironmentError, ExecutionEnvironment, ExecutionFailure, ExecutionResult};
use crate::llm::{LanguageModel, LlmError, LlmRequest};
use crate::tools::{ServerInfo, ToolDefinition, ToolError, ToolOutput, ToolServer};

/// Model replaying canned responses in order.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    hang: bool,
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedModel {
    pub fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|r| Ok(r.to_string())).collect()),
            fallback: None,
            hang: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Never answers; the call only ends when the engine gives up on it.
    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: None,
            hang: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answers every request with `response`.
    pub fn repeating(response: &str) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: Some(response.to_string()),
            hang: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: LlmError) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::from([Err(error)])),
            fallback: None,
            hang: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Content of the last message of the `n`th request.
    pub fn last_message(&self, n: usize) -> String {
        let requests = self.requests.lock().unwrap();
        requests[n].messages.last().unwrap().content.clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.hang {
            std::future::pending::<()>().await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(response) => response,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| LlmError::InvalidResponse("script exhausted".into())),
        }
    }
}

/// What a [`ScriptedEnvironment`] saw.
#[derive(Default)]
pub struct EnvProbe {
    pub executed: Mutex<Vec<String>>,
    pub starts: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl EnvProbe {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

/// Environment returning queued results; succeeds with empty output once the
/// queue is drained. A crash result marks the worker dead.
pub struct ScriptedEnvironment {
    results: VecDeque<ExecutionResult>,
    alive: bool,
    fail_start: bool,
    block_until_cancelled: bool,
    pub probe: Arc<EnvProbe>,
}

impl ScriptedEnvironment {
    pub fn new(results: Vec<ExecutionResult>) -> Self {
        Self {
            results: results.into(),
            alive: false,
            fail_start: false,
            block_until_cancelled: false,
            probe: Arc::new(EnvProbe::default()),
        }
    }

    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::new(Vec::new())
        }
    }

    /// Every execution runs until the run is cancelled.
    pub fn blocking() -> Self {
        Self {
            block_until_cancelled: true,
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for ScriptedEnvironment {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&mut self) -> Result<(), EnvironmentError> {
        if self.fail_start {
            return Err(EnvironmentError::Start("interpreter not found".into()));
        }
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        self.alive = true;
        Ok(())
    }

    async fn execute(
        &mut self,
        code: &str,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        self.probe.executed.lock().unwrap().push(code.to_string());
        if self.block_until_cancelled {
            cancel.cancelled().await;
            return ExecutionResult::failure(ExecutionFailure::Cancelled, "interrupted");
        }
        let result = self
            .results
            .pop_front()
            .unwrap_or_else(|| ExecutionResult::success(""));
        if result.is_crash() {
            self.alive = false;
        }
        result
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn shutdown(&mut self) -> Result<(), EnvironmentError> {
        self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.alive = false;
        Ok(())
    }
}

/// Tool server with an `echo` tool and a `fail` tool reporting an error.
pub struct EchoServer;

#[async_trait]
impl ToolServer for EchoServer {
    fn name(&self) -> &str {
        "util"
    }

    async fn connect(&self) -> Result<ServerInfo, ToolError> {
        Ok(ServerInfo {
            name: "util".into(),
            version: "0.1".into(),
            protocol_version: "2025-03-26".into(),
        })
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        Ok(vec![
            ToolDefinition {
                name: "echo".into(),
                description: "Echo text back".into(),
                input_schema: serde_json::json!({ "type": "object" }),
            },
            ToolDefinition {
                name: "fail".into(),
                description: "Always fails".into(),
                input_schema: serde_json::json!({ "type": "object" }),
            },
        ])
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        match tool {
            "echo" => Ok(ToolOutput::text(arguments["text"].as_str().unwrap_or(""))),
            _ => Ok(ToolOutput {
                content: vec![crate::tools::ToolContent::text("disk full")],
                is_error: true,
            }),
        }
    }
}

/// Read events until one of `kind` arrives.
pub async fn wait_for(events: &mut EventStream, kind: &str) -> AgentEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.next().await {
            if event.kind() == kind {
                return event;
            }
        }
        panic!("stream ended before {kind}");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

pub fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
    events.iter().map(AgentEvent::kind).collect()
}

pub fn count(events: &[AgentEvent], kind: &str) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}
