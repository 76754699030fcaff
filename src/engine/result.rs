//! Round history, metrics and the final result of a run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Outcome;
use crate::execution::{EnvironmentError, ExecutionResult};
use crate::llm::LlmError;
use crate::plan::Plan;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: serde_json::Value,
    pub output: String,
    pub is_error: bool,
    pub duration_ms: u64,
}

/// One completed round. Rounds interrupted by a terminal event are not recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub index: usize,
    /// Messages sent to the model for this round.
    pub request_messages: usize,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    /// The message fed back to the model after this round.
    pub observation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Round {
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }

    pub fn code_failed(&self) -> bool {
        self.result.as_ref().is_some_and(|r| !r.success)
    }
}

/// Cause of a [`Outcome::Failed`] run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailure {
    Model(LlmError),
    EnvironmentStart { message: String },
    EnvironmentCrash { message: String },
    MalformedResponses { attempts: u32 },
    Checkpoint { message: String },
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model(e) => write!(f, "model call failed: {e}"),
            Self::EnvironmentStart { message } => {
                write!(f, "execution environment failed to start: {message}")
            }
            Self::EnvironmentCrash { message } => {
                write!(f, "execution environment crashed: {message}")
            }
            Self::MalformedResponses { attempts } => {
                write!(f, "model produced {attempts} consecutive malformed responses")
            }
            Self::Checkpoint { message } => write!(f, "checkpoint could not be opened: {message}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub rounds: usize,
    pub llm_calls: usize,
    pub llm_latency_ms: u64,
    pub executions: usize,
    pub execution_failures: usize,
    pub timeouts: usize,
    pub execution_time_ms: u64,
    pub tool_calls: usize,
    pub tool_errors: usize,
    pub restarts: u32,
    pub malformed_responses: usize,
    pub answers_rejected: usize,
}

impl RunMetrics {
    pub fn record_round(&mut self) {
        self.rounds += 1;
    }

    pub fn record_llm_call(&mut self, latency: Duration) {
        self.llm_calls += 1;
        self.llm_latency_ms += latency.as_millis() as u64;
    }

    pub fn record_execution(&mut self, result: &ExecutionResult) {
        self.executions += 1;
        self.execution_time_ms += result.duration_ms;
        if !result.success {
            self.execution_failures += 1;
        }
        if result.is_timeout() {
            self.timeouts += 1;
        }
    }

    pub fn record_tool_call(&mut self, is_error: bool) {
        self.tool_calls += 1;
        if is_error {
            self.tool_errors += 1;
        }
    }

    pub fn record_restart(&mut self) {
        self.restarts += 1;
    }

    pub fn record_malformed(&mut self) {
        self.malformed_responses += 1;
    }

    pub fn record_answer_rejected(&mut self) {
        self.answers_rejected += 1;
    }

    pub fn avg_llm_latency_ms(&self) -> u64 {
        if self.llm_calls == 0 {
            0
        } else {
            self.llm_latency_ms / self.llm_calls as u64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub task: String,
    pub outcome: Outcome,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    pub rounds: Vec<Round>,
    pub metrics: RunMetrics,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }

    /// The accepted answer, or the error describing why there is none.
    pub fn into_answer(self) -> crate::Result<String> {
        match self.outcome {
            Outcome::Completed => Ok(self.answer.unwrap_or_default()),
            Outcome::Rejected => Err(crate::Error::HitlRejected {
                reason: self.reason,
            }),
            Outcome::Aborted => Err(crate::Error::Cancelled(self.reason)),
            Outcome::MaxRoundsExceeded => Err(crate::Error::MaxRoundsExceeded {
                rounds: self.rounds.len(),
            }),
            Outcome::Failed => Err(match self.failure {
                Some(RunFailure::Model(e)) => crate::Error::Llm(e),
                Some(RunFailure::EnvironmentStart { message }) => {
                    crate::Error::Environment(EnvironmentError::Start(message))
                }
                Some(RunFailure::EnvironmentCrash { message }) => {
                    crate::Error::ExecutionCrash(message)
                }
                Some(RunFailure::MalformedResponses { attempts }) => {
                    crate::Error::MalformedResponses { attempts }
                }
                Some(RunFailure::Checkpoint { message }) => {
                    crate::Error::CheckpointUnavailable(message)
                }
                None => crate::Error::Environment(EnvironmentError::Crashed(self.reason)),
            }),
        }
    }
}
