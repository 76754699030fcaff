//! Agent execution engine.
//!
//! The [`Engine`] drives a run as a sequence of rounds. Each round asks the
//! model for its next move, tracks the plan, calls tools, executes code in the
//! persistent environment and feeds the observation into the next request.
//! Every transition is published to the run's [`EventLog`](crate::events::EventLog),
//! and a [`RunController`] lets humans answer HITL checkpoints while the run
//! is suspended.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use datapilot::engine::{Engine, EngineConfig};
//! use datapilot::execution::ProcessEnvironment;
//! use datapilot::hitl::HitlMode;
//! use datapilot::llm::{OpenAiCompatibleModel, OpenAiConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let model = OpenAiCompatibleModel::new(OpenAiConfig::new("gpt-4o"))?;
//! let engine = Engine::builder()
//!     .llm(Arc::new(model))
//!     .environment(ProcessEnvironment::python("./workspace"))
//!     .config(EngineConfig::default().with_hitl_mode(HitlMode::PlanOnly))
//!     .build()?;
//!
//! let handle = engine.spawn("Summarise sales.csv by region");
//! // handle.controller.approve(None)?; when the plan checkpoint opens
//! let result = handle.wait().await?;
//! println!("{}", result.into_answer()?);
//! # Ok(())
//! # }
//! ```

mod config;
mod controller;
mod prompt;
mod result;
mod runner;
mod snapshot;

#[cfg(test)]
mod tests;

pub use config::EngineConfig;
pub use controller::{RunController, RunHandle};
pub use prompt::{format_execution, format_tool_result, strip_ansi, system_prompt, truncate_output};
pub use result::{Round, RunFailure, RunMetrics, RunResult, ToolCallRecord};
pub use runner::{Engine, EngineBuilder};
pub use snapshot::RunSnapshot;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Starting,
    Running,
    Finished,
    Aborted,
    Failed,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Aborted | Self::Failed)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Completed,
    Rejected,
    Aborted,
    Failed,
    MaxRoundsExceeded,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
            Self::MaxRoundsExceeded => "max-rounds-exceeded",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Engine state a run settles in after this outcome.
    pub fn final_state(&self) -> EngineState {
        match self {
            Self::Completed => EngineState::Finished,
            Self::Rejected | Self::Aborted => EngineState::Aborted,
            Self::Failed | Self::MaxRoundsExceeded => EngineState::Failed,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
