//! Ordered event stream of a run.
//!
//! Every observable transition of the engine is published to an [`EventLog`]
//! as an [`AgentEvent`]. Sequence numbers start at 1 and increase by one per
//! event. Consumers attach with [`EventLog::subscribe`] and always read from the
//! first event, each at its own pace.

mod journal;
mod log;

pub use journal::EventJournal;
pub use log::{EventLog, EventStream};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::Outcome;
use crate::execution::{Artifact, ExecutionFailure};
use crate::plan::Plan;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RunStarted {
        run_id: String,
        task: String,
        hitl_mode: String,
        max_rounds: usize,
    },
    RunFinished {
        outcome: Outcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<String>,
        rounds: usize,
    },
    RunError {
        message: String,
    },
    RoundStarted {
        round: usize,
        max_rounds: usize,
    },
    RoundFinished {
        round: usize,
        duration_ms: u64,
    },
    LlmCallStarted {
        round: usize,
        messages: usize,
    },
    LlmCallFinished {
        round: usize,
        latency_ms: u64,
        preview: String,
    },
    PlanCreated {
        plan: Plan,
    },
    PlanUpdated {
        plan: Plan,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ToolCallStarted {
        round: usize,
        name: String,
        arguments: serde_json::Value,
    },
    ToolCallFinished {
        round: usize,
        name: String,
        output: String,
        is_error: bool,
        duration_ms: u64,
    },
    CodeExecuting {
        round: usize,
        code: String,
    },
    CodeSuccess {
        round: usize,
        output: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<Artifact>,
        duration_ms: u64,
    },
    CodeFailed {
        round: usize,
        failure: ExecutionFailure,
        error: String,
        output: String,
        duration_ms: u64,
    },
    EnvironmentRestarted {
        round: usize,
        reason: String,
        restarts: u32,
    },
    AnswerAccepted {
        answer: String,
    },
    AnswerRejected {
        answer: String,
        reason: String,
    },
    HitlAwaitingPlanApproval {
        interaction_id: String,
        plan: Plan,
    },
    HitlAwaitingCodeApproval {
        interaction_id: String,
        code: String,
    },
    HitlAwaitingErrorGuidance {
        interaction_id: String,
        code: String,
        error: String,
    },
    HitlAwaitingAnswerApproval {
        interaction_id: String,
        answer: String,
    },
    HitlFeedbackReceived {
        interaction_id: String,
        feedback: String,
    },
    HitlPlanApproved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    HitlPlanModified {
        plan: Plan,
    },
    HitlPlanRejected {
        reason: String,
    },
    HitlCodeApproved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    HitlCodeModified {
        code: String,
    },
    HitlStepSkipped {
        round: usize,
    },
    HitlAnswerApproved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    HitlExecutionAborted {
        reason: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunFinished { .. } => "run_finished",
            Self::RunError { .. } => "run_error",
            Self::RoundStarted { .. } => "round_started",
            Self::RoundFinished { .. } => "round_finished",
            Self::LlmCallStarted { .. } => "llm_call_started",
            Self::LlmCallFinished { .. } => "llm_call_finished",
            Self::PlanCreated { .. } => "plan_created",
            Self::PlanUpdated { .. } => "plan_updated",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallFinished { .. } => "tool_call_finished",
            Self::CodeExecuting { .. } => "code_executing",
            Self::CodeSuccess { .. } => "code_success",
            Self::CodeFailed { .. } => "code_failed",
            Self::EnvironmentRestarted { .. } => "environment_restarted",
            Self::AnswerAccepted { .. } => "answer_accepted",
            Self::AnswerRejected { .. } => "answer_rejected",
            Self::HitlAwaitingPlanApproval { .. } => "hitl_awaiting_plan_approval",
            Self::HitlAwaitingCodeApproval { .. } => "hitl_awaiting_code_approval",
            Self::HitlAwaitingErrorGuidance { .. } => "hitl_awaiting_error_guidance",
            Self::HitlAwaitingAnswerApproval { .. } => "hitl_awaiting_answer_approval",
            Self::HitlFeedbackReceived { .. } => "hitl_feedback_received",
            Self::HitlPlanApproved { .. } => "hitl_plan_approved",
            Self::HitlPlanModified { .. } => "hitl_plan_modified",
            Self::HitlPlanRejected { .. } => "hitl_plan_rejected",
            Self::HitlCodeApproved { .. } => "hitl_code_approved",
            Self::HitlCodeModified { .. } => "hitl_code_modified",
            Self::HitlStepSkipped { .. } => "hitl_step_skipped",
            Self::HitlAnswerApproved { .. } => "hitl_answer_approved",
            Self::HitlExecutionAborted { .. } => "hitl_execution_aborted",
        }
    }

    pub fn is_hitl(&self) -> bool {
        self.kind().starts_with("hitl_")
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. })
    }
}
