//! Plan model: an ordered checklist of steps tracked across rounds.
//!
//! A plan is parsed from free-form model output using a checkbox grammar:
//!
//! ```text
//! 1. [x] Load data
//! 2. [ ] Plot results
//! - [X] Bulleted steps work too
//! ```
//!
//! Lines that do not match the grammar are ignored. A block without a single
//! recognizable step is a [`ParseError::NoSteps`].

pub mod response;

pub use response::{ParsedResponse, ToolCallRequest};

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

fn step_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:\d+[.)]|[-*+])?\s*\[([ xX✓✔]?)\]\s*(\S.*?)\s*$")
            .expect("valid plan step regex")
    })
}

/// Errors produced while parsing model output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("plan block contains no recognizable steps")]
    NoSteps,

    #[error("invalid tool call: {0}")]
    InvalidToolCall(String),
}

/// One checklist item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub text: String,
    pub completed: bool,
}

impl Step {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            completed: false,
        }
    }

    pub fn completed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            completed: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    raw: String,
    steps: Vec<Step>,
}

impl Plan {
    /// Parse a checklist block into a plan.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let steps: Vec<Step> = raw
            .lines()
            .filter_map(|line| {
                let caps = step_regex().captures(line)?;
                let completed = !caps[1].trim().is_empty();
                Some(Step {
                    text: caps[2].to_string(),
                    completed,
                })
            })
            .collect();

        if steps.is_empty() {
            return Err(ParseError::NoSteps);
        }

        Ok(Self {
            raw: raw.trim().to_string(),
            steps,
        })
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        let mut plan = Self {
            raw: String::new(),
            steps,
        };
        plan.raw = plan.to_checklist();
        plan
    }

    /// Merge a freshly parsed plan into the previous one.
    ///
    /// The result follows `new`'s ordering. A step whose text exactly matches a
    /// step of `old` keeps that step's completion; completion is never reverted.
    /// Duplicate texts are matched in order. Steps absent from `new` are dropped.
    pub fn merge(old: &Plan, new: Plan) -> Plan {
        let mut consumed = vec![false; old.steps.len()];
        let steps = new
            .steps
            .into_iter()
            .map(|step| {
                let matched = old
                    .steps
                    .iter()
                    .enumerate()
                    .find(|(i, prev)| !consumed[*i] && prev.text == step.text);
                match matched {
                    Some((i, prev)) => {
                        consumed[i] = true;
                        Step {
                            completed: step.completed || prev.completed,
                            text: step.text,
                        }
                    }
                    None => step,
                }
            })
            .collect();

        Plan {
            raw: new.raw,
            steps,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.completed)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.completed).count()
    }

    /// First step not yet completed.
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| !s.completed)
    }

    pub fn pending_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| !s.completed)
    }

    /// Whether both plans list the same step texts in the same order.
    pub fn same_structure(&self, other: &Plan) -> bool {
        self.steps.len() == other.steps.len()
            && self
                .steps
                .iter()
                .zip(&other.steps)
                .all(|(a, b)| a.text == b.text)
    }

    pub fn to_checklist(&self) -> String {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mark = if s.completed { 'x' } else { ' ' };
                format!("{}. [{}] {}", i + 1, mark, s.text)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_checklist())
    }
}

impl std::str::FromStr for Plan {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
