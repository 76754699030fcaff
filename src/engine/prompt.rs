//! System prompt and observation formatting.

use std::sync::OnceLock;

use regex::Regex;

use crate::execution::ExecutionResult;
use crate::tools::{ToolDescriptor, ToolError, ToolOutput};

const PROTOCOL: &str = r#"You are an autonomous data analysis agent. You solve the task by keeping a numbered plan and executing Python code, one step at a time, in a persistent interpreter. Variables, imports and loaded data survive between code blocks.

## Response format

Structure every response with these tags:

<plan>
1. [x] A finished step
2. [ ] The step you are working on
3. [ ] A later step
</plan>
The current plan. Include it in every response and mark a step [x] as soon as its result is confirmed.

<think>...</think>
Reasoning about the last observation and what to do next. Never executed.

<plan_update>...</plan_update>
Why you changed the plan, when you add, remove or reorder steps.

<code>
```python
...
```
</code>
Exactly one focused code block per response. Its output is returned to you in the next message.

<answer>...</answer>
The final answer: a complete summary of findings and results. Only allowed once every plan step is marked [x].

## Rules

- Work on one step per response and wait for the execution result before moving on.
- If code fails, read the error, fix the code, and adjust the plan if the approach has to change.
- Save charts and other outputs to files (for example `plt.savefig("chart.png")`) so they are kept as artifacts.
- Never answer while a step is still [ ]."#;

const TOOLS_HEADER: &str = r#"## Tools

You can also call external tools. Emit one tag per call; the result is returned in the next message:

<tool_call>{"name": "server__tool", "arguments": {...}}</tool_call>

Available tools:"#;

pub(crate) const CONTINUE_PROMPT: &str = "Please continue with the next step of your plan.";

pub(crate) const ANSWER_REMINDER: &str = "Please complete all remaining plan steps before providing the final answer. Some steps are still marked as [ ].";

pub(crate) const FAILED_CODE_REMINDER: &str =
    "The code in your last response failed. Fix the error before providing the final answer.";

pub(crate) const SKIPPED_CODE_NOTICE: &str =
    "A human reviewer skipped this code block. It was not executed; continue with your plan.";

/// Full system prompt, listing `tools` when there are any.
pub fn system_prompt(tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return PROTOCOL.to_string();
    }

    let mut prompt = format!("{PROTOCOL}\n\n{TOOLS_HEADER}\n");
    for tool in tools {
        prompt.push_str(&format!("\n- {}", tool.name));
        if !tool.description.is_empty() {
            prompt.push_str(&format!(": {}", tool.description));
        }
        if !tool.input_schema.is_null() {
            prompt.push_str(&format!("\n  input schema: {}", tool.input_schema));
        }
    }
    prompt
}

pub(crate) fn task_message(task: &str) -> String {
    format!("Task: {task}")
}

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[@-Z\\-_]").expect("valid ANSI escape regex")
    })
}

/// Remove terminal escape sequences from interpreter output.
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

/// Keep the first `max_chars` characters and note how much was dropped.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n... (truncated, {total} chars total)")
}

fn clean(text: &str, max_chars: usize) -> String {
    truncate_output(strip_ansi(text).trim_end(), max_chars)
}

/// Observation for an executed code block.
pub fn format_execution(code: &str, result: &ExecutionResult, max_chars: usize) -> String {
    let mut text = format!("Code executed:\n```python\n{code}\n```\n");

    if result.success {
        let output = clean(&result.output, max_chars);
        if output.is_empty() {
            text.push_str("\nOutput: (no output)");
        } else {
            text.push_str(&format!("\nOutput:\n{output}"));
        }
    } else {
        let kind = result
            .failure
            .map(|f| f.to_string())
            .unwrap_or_else(|| "error".into());
        text.push_str(&format!("\nError ({kind}):\n{}", clean(&result.error_output, max_chars)));
        let output = clean(&result.output, max_chars);
        if !output.is_empty() {
            text.push_str(&format!("\n\nOutput before the error:\n{output}"));
        }
    }

    let images = result.artifacts.iter().filter(|a| a.is_image()).count();
    if images > 0 {
        text.push_str(&format!("\n[{images} image(s) generated]"));
    }
    if !result.artifacts.is_empty() {
        let names: Vec<String> = result
            .artifacts
            .iter()
            .map(|a| {
                a.path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| a.path.display().to_string())
            })
            .collect();
        text.push_str(&format!("\n[artifacts: {}]", names.join(", ")));
    }
    text
}

/// Observation for a tool call.
pub fn format_tool_result(
    name: &str,
    result: &Result<ToolOutput, ToolError>,
    max_chars: usize,
) -> String {
    match result {
        Ok(output) => format!(
            "Tool `{name}` returned:\n{}",
            truncate_output(&output.to_text(), max_chars)
        ),
        Err(e) => format!("Tool `{name}` failed: {e}"),
    }
}
