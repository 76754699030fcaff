//! Execution environment contract.
//!
//! An [`ExecutionEnvironment`] runs generated code against a persistent
//! session: bindings created by one call are visible to the next until the
//! environment is restarted. Failures are classified so the engine can tell a
//! failing program apart from a dead worker.

mod process;

pub use process::{DRIVER_SCRIPT, ProcessConfig, ProcessEnvironment};

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Why an execution did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// The code itself raised an error.
    Code,
    /// The call exceeded its time limit and was interrupted.
    Timeout,
    /// The worker died or stopped responding.
    Crash,
    /// The run was cancelled while the code was executing.
    Cancelled,
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Code => "code error",
            Self::Timeout => "timeout",
            Self::Crash => "environment crash",
            Self::Cancelled => "cancelled",
        })
    }
}

/// A file produced by an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub mime_type: String,
    pub size_bytes: u64,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        let path = path.into();
        let mime_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            path,
            mime_type,
            size_bytes,
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ExecutionFailure>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error_output: String::new(),
            failure: None,
            artifacts: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn failure(kind: ExecutionFailure, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error_output: error.into(),
            failure: Some(kind),
            artifacts: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.failure == Some(ExecutionFailure::Timeout)
    }

    pub fn is_crash(&self) -> bool {
        self.failure == Some(ExecutionFailure::Crash)
    }

    pub fn is_cancelled(&self) -> bool {
        self.failure == Some(ExecutionFailure::Cancelled)
    }

    /// Human-readable failure description, empty on success.
    pub fn error_summary(&self) -> String {
        match self.failure {
            None => String::new(),
            Some(kind) if self.error_output.trim().is_empty() => kind.to_string(),
            Some(ExecutionFailure::Code) => self.error_output.trim().to_string(),
            Some(kind) => format!("{}: {}", kind, self.error_output.trim()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("failed to start execution environment: {0}")]
    Start(String),

    #[error("execution environment crashed: {0}")]
    Crashed(String),

    #[error("execution environment is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistent code execution capability owned by a single engine.
#[async_trait]
pub trait ExecutionEnvironment: Send {
    fn name(&self) -> &str;

    async fn start(&mut self) -> Result<(), EnvironmentError>;

    /// Run `code` in the persistent session.
    ///
    /// Never hangs past `timeout` plus a short grace period. A dead worker is
    /// reported as [`ExecutionFailure::Crash`] and cancellation as
    /// [`ExecutionFailure::Cancelled`].
    async fn execute(
        &mut self,
        code: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult;

    fn is_alive(&self) -> bool;

    /// Discard all session state and start a fresh worker.
    async fn restart(&mut self) -> Result<(), EnvironmentError> {
        self.shutdown().await?;
        self.start().await
    }

    async fn shutdown(&mut self) -> Result<(), EnvironmentError>;
}
