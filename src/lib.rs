//! # datapilot
//!
//! Autonomous plan-and-execute agent engine.
//!
//! A run takes a natural-language task, asks a language model for a numbered
//! plan, and works through it round by round: model-written code executes in a
//! persistent interpreter, external tools are called over MCP, and the results
//! are fed back until the plan is complete and an answer is accepted. Humans can
//! be put in the loop at plan, code, error and answer checkpoints.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use datapilot::{Engine, EngineConfig, ProcessEnvironment};
//! use datapilot::llm::{OpenAiCompatibleModel, OpenAiConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), datapilot::Error> {
//!     let model = OpenAiCompatibleModel::new(OpenAiConfig::new("gpt-4o"))?;
//!     let engine = Engine::builder()
//!         .llm(Arc::new(model))
//!         .environment(ProcessEnvironment::python("./workspace"))
//!         .config(EngineConfig::default())
//!         .build()?;
//!
//!     let answer = engine.run("Which region had the highest sales?").await.into_answer()?;
//!     println!("{answer}");
//!     Ok(())
//! }
//! ```
//!
//! ## Watching events and answering checkpoints
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use datapilot::{Engine, EventPayload, HitlMode};
//! use datapilot::execution::ProcessEnvironment;
//! use datapilot::llm::{OpenAiCompatibleModel, OpenAiConfig};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), datapilot::Error> {
//! let model = OpenAiCompatibleModel::new(OpenAiConfig::new("gpt-4o"))?;
//! let handle = Engine::builder()
//!     .llm(Arc::new(model))
//!     .environment(ProcessEnvironment::python("./workspace"))
//!     .hitl_mode(HitlMode::PlanOnly)
//!     .build()?
//!     .spawn("Forecast next month's demand");
//!
//! let mut events = handle.controller.events();
//! while let Some(event) = events.next().await {
//!     if let EventPayload::HitlAwaitingPlanApproval { plan, .. } = &event.payload {
//!         println!("{plan}");
//!         handle.controller.approve(None)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod context;
pub mod engine;
pub mod events;
pub mod execution;
pub mod hitl;
pub mod llm;
pub mod plan;
pub mod tools;

// Re-exports for convenience
pub use config::{ConfigError, EnvSource, Settings};
pub use context::RunContext;
pub use engine::{
    Engine, EngineBuilder, EngineConfig, EngineState, Outcome, Round, RunController, RunFailure,
    RunHandle, RunMetrics, RunResult, RunSnapshot,
};
pub use events::{AgentEvent, EventJournal, EventLog, EventPayload, EventStream};
pub use execution::{
    EnvironmentError, ExecutionEnvironment, ExecutionFailure, ExecutionResult, ProcessConfig,
    ProcessEnvironment,
};
pub use hitl::{Checkpoint, HitlError, HitlMode, HitlState, PendingInteraction};
pub use llm::{LanguageModel, LlmError, LlmRequest, Message, OpenAiCompatibleModel};
pub use plan::{ParseError, ParsedResponse, Plan, Step};
pub use tools::{ToolConfigError, ToolDescriptor, ToolError, ToolManager, ToolOutput, ToolServer};

/// Error type for datapilot operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Model output could not be parsed.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Generated code exceeded its time limit.
    #[error("Execution timed out after {:.1}s", .0.as_secs_f64())]
    ExecutionTimeout(std::time::Duration),

    /// The execution environment died and could not be recovered.
    #[error("Execution environment crashed: {0}")]
    ExecutionCrash(String),

    /// Execution environment could not be started or controlled.
    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    /// Tool invocation failed.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Tool server configuration is invalid.
    #[error("Tool configuration error: {0}")]
    ToolConfig(#[from] ToolConfigError),

    /// A human rejected the run at a checkpoint.
    #[error("Rejected by reviewer: {reason}")]
    HitlRejected { reason: String },

    /// A HITL control call did not match the pending interaction.
    #[error("HITL error: {0}")]
    Hitl(#[from] HitlError),

    /// An enabled checkpoint could not suspend the run.
    #[error("HITL checkpoint unavailable: {0}")]
    CheckpointUnavailable(String),

    /// The round limit was reached before the plan completed.
    #[error("Max rounds exceeded after {rounds} rounds")]
    MaxRoundsExceeded { rounds: usize },

    /// The model kept answering outside the response format.
    #[error("Model produced {attempts} consecutive malformed responses")]
    MalformedResponses { attempts: u32 },

    /// Language model call failed.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The run was cancelled.
    #[error("Run cancelled: {0}")]
    Cancelled(String),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Settings, tool configuration or invalid input
    Configuration,
    /// Network, rate limit, or server errors that may succeed on retry
    Transient,
    /// Execution environment timeouts and crashes
    Environment,
    /// Human decisions: rejection, cancellation, misuse of HITL controls
    User,
    /// Limits enforced by the engine (rounds, malformed responses)
    Policy,
    /// Internal errors (IO, JSON, parse, tools)
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::ToolConfig(_) => ErrorCategory::Configuration,
            Error::Llm(LlmError::Config(_)) => ErrorCategory::Configuration,
            Error::Llm(e) if e.is_retryable() => ErrorCategory::Transient,
            Error::Tool(ToolError::Unreachable { .. }) => ErrorCategory::Transient,

            Error::ExecutionTimeout(_) | Error::ExecutionCrash(_) | Error::Environment(_) => {
                ErrorCategory::Environment
            }

            Error::HitlRejected { .. } | Error::Hitl(_) | Error::Cancelled(_) => {
                ErrorCategory::User
            }

            Error::MaxRoundsExceeded { .. } | Error::MalformedResponses { .. } => {
                ErrorCategory::Policy
            }

            Error::Llm(_)
            | Error::Parse(_)
            | Error::CheckpointUnavailable(_)
            | Error::Tool(_)
            | Error::Io(_)
            | Error::Json(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_configuration_error(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Error::Llm(e) => e.retry_after(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
