//! Human-in-the-loop checkpoints.
//!
//! The [`HitlMode`] selects which [`Checkpoint`]s are active. When the engine
//! reaches an active checkpoint the [`HitlGateway`] records a single
//! [`PendingInteraction`] and the round loop suspends until a human resolves
//! it through the gateway's control methods.

mod gateway;

pub use gateway::{CheckpointWait, GatewaySignal, HitlGateway};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::{ParseError, Plan};

/// Which checkpoints interrupt the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HitlMode {
    #[default]
    #[serde(alias = "off")]
    None,
    #[serde(alias = "plan_only", alias = "plan")]
    PlanOnly,
    #[serde(alias = "on_error")]
    OnError,
    #[serde(alias = "plan_and_answer", alias = "plan_answer")]
    PlanAndAnswer,
    Full,
}

impl HitlMode {
    pub fn checkpoints(&self) -> &'static [Checkpoint] {
        use Checkpoint::*;
        match self {
            Self::None => &[],
            Self::PlanOnly => &[PlanApproval],
            Self::OnError => &[ErrorGuidance],
            Self::PlanAndAnswer => &[PlanApproval, AnswerApproval],
            Self::Full => &[PlanApproval, CodeApproval, ErrorGuidance, AnswerApproval],
        }
    }

    pub fn enables(&self, checkpoint: Checkpoint) -> bool {
        self.checkpoints().contains(&checkpoint)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::PlanOnly => "plan-only",
            Self::OnError => "on-error",
            Self::PlanAndAnswer => "plan-and-answer",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for HitlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HitlMode {
    type Err = HitlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "none" | "off" => Ok(Self::None),
            "plan-only" | "plan" => Ok(Self::PlanOnly),
            "on-error" => Ok(Self::OnError),
            "plan-and-answer" | "plan-answer" => Ok(Self::PlanAndAnswer),
            "full" => Ok(Self::Full),
            _ => Err(HitlError::UnknownMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    PlanApproval,
    CodeApproval,
    ErrorGuidance,
    AnswerApproval,
}

impl Checkpoint {
    pub fn awaiting_state(&self) -> HitlState {
        match self {
            Self::PlanApproval => HitlState::AwaitingPlanApproval,
            Self::CodeApproval => HitlState::AwaitingCodeApproval,
            Self::ErrorGuidance => HitlState::AwaitingErrorGuidance,
            Self::AnswerApproval => HitlState::AwaitingAnswerApproval,
        }
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::PlanApproval => "plan approval",
            Self::CodeApproval => "code approval",
            Self::ErrorGuidance => "error guidance",
            Self::AnswerApproval => "answer approval",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlState {
    #[default]
    Idle,
    AwaitingPlanApproval,
    AwaitingCodeApproval,
    AwaitingErrorGuidance,
    AwaitingAnswerApproval,
    Aborted,
}

impl HitlState {
    pub fn is_waiting(&self) -> bool {
        !matches!(self, Self::Idle | Self::Aborted)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// What the human is asked to look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InteractionPayload {
    Plan { plan: Plan },
    Code { code: String },
    Error { code: String, error: String },
    Answer { answer: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInteraction {
    pub id: String,
    pub checkpoint: Checkpoint,
    pub payload: InteractionPayload,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub feedback: Vec<String>,
}

/// How a pending interaction was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Approved { note: Option<String> },
    Rejected { reason: String },
    PlanModified(Plan),
    CodeModified(String),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HitlError {
    #[error("no pending interaction")]
    NoPendingInteraction,

    #[error("'{action}' is not valid while awaiting {checkpoint}")]
    InvalidAction {
        action: &'static str,
        checkpoint: Checkpoint,
    },

    #[error("modified plan is invalid: {0}")]
    InvalidPlan(#[from] ParseError),

    #[error("an interaction is already pending")]
    AlreadyPending,

    #[error("run was aborted: {0}")]
    Aborted(String),

    #[error("unknown HITL mode: {0}")]
    UnknownMode(String),
}
