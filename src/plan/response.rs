//! Tag grammar for model responses.
//!
//! Responses are split into `<plan>`, `<plan_update>`, `<think>`, `<code>`,
//! `<answer>` and `<tool_call>` sections. Closing tags for `<code>` and
//! `<answer>` are optional because they double as stop sequences.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{ParseError, Plan};

fn section_regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid response section regex"))
}

fn plan_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    section_regex(
        &RE,
        r"(?is)<plan>(.*?)(?:</plan>|<code>|<answer>|<think>|<tool_call>|\z)",
    )
}

fn plan_update_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    section_regex(&RE, r"(?is)<plan_update>(.*?)(?:</plan_update>|\z)")
}

fn think_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    section_regex(&RE, r"(?is)<think>(.*?)(?:</think>|\z)")
}

fn code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    section_regex(&RE, r"(?is)<code>(.*?)(?:</code>|\z)")
}

fn answer_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    section_regex(&RE, r"(?is)<answer>(.*?)(?:</answer>|\z)")
}

fn tool_call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    section_regex(&RE, r"(?is)<tool_call>(.*?)</tool_call>")
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    section_regex(&RE, r"(?s)^```[A-Za-z0-9_+-]*[ \t]*\n?(.*?)\n?```\s*$")
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    pub plan: Option<Plan>,
    pub plan_error: Option<ParseError>,
    pub plan_update: Option<String>,
    pub thinking: Option<String>,
    pub code: Option<String>,
    pub answer: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tool_call_errors: Vec<ParseError>,
    text: String,
    empty_tag: bool,
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text).map(|c| c[1].trim().to_string())
}

fn strip_fences(code: &str) -> String {
    match fence_regex().captures(code) {
        Some(caps) => caps[1].trim().to_string(),
        None => code.to_string(),
    }
}

impl ParsedResponse {
    pub fn parse(text: &str) -> Self {
        let mut parsed = Self {
            text: text.trim().to_string(),
            ..Default::default()
        };

        if let Some(raw) = capture(plan_regex(), text) {
            match Plan::parse(&raw) {
                Ok(plan) => parsed.plan = Some(plan),
                Err(e) => {
                    parsed.empty_tag |= raw.is_empty();
                    parsed.plan_error = Some(e);
                }
            }
        }

        parsed.plan_update = capture(plan_update_regex(), text);
        parsed.thinking = capture(think_regex(), text);

        if let Some(raw) = capture(code_regex(), text) {
            let code = strip_fences(&raw);
            if code.trim().is_empty() {
                parsed.empty_tag = true;
            } else {
                parsed.code = Some(code);
            }
        }

        if let Some(answer) = capture(answer_regex(), text) {
            if answer.is_empty() {
                parsed.empty_tag = true;
            } else {
                parsed.answer = Some(answer);
            }
        }

        for caps in tool_call_regex().captures_iter(text) {
            match serde_json::from_str::<ToolCallRequest>(caps[1].trim()) {
                Ok(call) if !call.name.is_empty() => parsed.tool_calls.push(call),
                Ok(_) => parsed
                    .tool_call_errors
                    .push(ParseError::InvalidToolCall("missing tool name".into())),
                Err(e) => parsed
                    .tool_call_errors
                    .push(ParseError::InvalidToolCall(e.to_string())),
            }
        }

        parsed
    }

    /// Whether the response asks for plan tracking, code, or tools.
    pub fn is_actionable(&self) -> bool {
        self.plan.is_some() || self.code.is_some() || !self.tool_calls.is_empty()
    }

    /// Signals that the model intends to keep working.
    pub fn has_further_action_marker(&self) -> bool {
        self.thinking.is_some()
            || self.plan_update.is_some()
            || self.empty_tag
            || self.plan_error.is_some()
            || !self.tool_call_errors.is_empty()
    }

    /// The final answer this response proposes, if any.
    ///
    /// An explicit `<answer>` section always counts. A bare response with no
    /// sections at all is treated as an answer as well.
    pub fn final_answer(&self) -> Option<&str> {
        if let Some(answer) = &self.answer {
            return Some(answer);
        }
        if self.is_actionable() || self.has_further_action_marker() || self.text.is_empty() {
            return None;
        }
        Some(&self.text)
    }

    /// A round that produced nothing the engine can act on.
    pub fn is_malformed(&self) -> bool {
        self.plan_error.is_some() || (!self.is_actionable() && self.final_answer().is_none())
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}
