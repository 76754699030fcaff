//! Resumable run state.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::prompt::task_message;
use super::{Round, RunMetrics, RunResult};
use crate::llm::Message;
use crate::plan::Plan;

/// Enough state to continue a run with a fresh engine.
///
/// The conversation is rebuilt from the recorded rounds, so a snapshot holds
/// each model response and observation exactly once. Interpreter state is
/// not captured; a resumed run starts with an empty session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub rounds: Vec<Round>,
    #[serde(default)]
    pub metrics: RunMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn new(run_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            task: task.into(),
            plan: None,
            rounds: Vec::new(),
            metrics: RunMetrics::default(),
            answer: None,
            created_at: Utc::now(),
        }
    }

    /// Index of the round a resumed run starts with.
    pub fn next_round(&self) -> usize {
        self.rounds.last().map_or(1, |r| r.index + 1)
    }

    /// Conversation to send on the next request.
    pub fn messages(&self, system_prompt: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2 + self.rounds.len() * 2);
        messages.push(Message::system(system_prompt));
        messages.push(Message::user(task_message(&self.task)));
        for round in &self.rounds {
            messages.push(Message::assistant(&round.response));
            messages.push(Message::user(&round.observation));
        }
        messages
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_json()?).await?;
        tracing::debug!(path = %path.display(), rounds = self.rounds.len(), "snapshot saved");
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&text)
    }
}

impl From<&RunResult> for RunSnapshot {
    fn from(result: &RunResult) -> Self {
        Self {
            run_id: result.run_id.clone(),
            task: result.task.clone(),
            plan: result.plan.clone(),
            rounds: result.rounds.clone(),
            metrics: result.metrics.clone(),
            answer: result.answer.clone(),
            created_at: Utc::now(),
        }
    }
}
