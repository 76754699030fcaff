//! Engine scenarios driven by scripted models and environments.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{EchoServer, ScriptedEnvironment, ScriptedModel, count, kinds, wait_for};

use super::prompt::ANSWER_REMINDER;
use super::{Engine, EngineConfig, EngineState, Outcome, RunFailure, RunSnapshot};
use crate::context::RunContext;
use crate::events::EventPayload;
use crate::execution::{ExecutionFailure, ExecutionResult};
use crate::hitl::{Checkpoint, HitlError, HitlMode, InteractionPayload};
use crate::llm::LlmError;
use crate::plan::Plan;
use crate::tools::ToolManager;

const OPEN_PLAN_WITH_CODE: &str = "<plan>\n1. [ ] Load data\n</plan>\n<code>\n```python\ndf = load()\n```\n</code>";
const DONE_WITH_ANSWER: &str = "<plan>\n1. [x] Load data\n</plan>\n<answer>3 rows</answer>";

fn engine(model: &Arc<ScriptedModel>, env: ScriptedEnvironment, mode: HitlMode) -> Engine {
    Engine::builder()
        .llm(model.clone())
        .environment(env)
        .config(EngineConfig::default().with_hitl_mode(mode))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_completes_with_ordered_events() {
    let model = ScriptedModel::new(&[OPEN_PLAN_WITH_CODE, DONE_WITH_ANSWER]);
    let env = ScriptedEnvironment::new(vec![ExecutionResult::success("loaded")]);
    let probe = env.probe.clone();
    let engine = engine(&model, env, HitlMode::None);
    let controller = engine.controller();

    let result = engine.run("Load the data").await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.answer.as_deref(), Some("3 rows"));
    assert_eq!(result.rounds.len(), 2);
    assert!(result.plan.as_ref().is_some_and(Plan::is_complete));
    assert_eq!(probe.executed(), vec!["df = load()"]);
    assert_eq!(probe.shutdowns.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(controller.state(), EngineState::Finished);

    let events = controller.event_history();
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64 + 1);
    }
    assert_eq!(
        kinds(&events),
        vec![
            "run_started",
            "round_started",
            "llm_call_started",
            "llm_call_finished",
            "plan_created",
            "code_executing",
            "code_success",
            "round_finished",
            "round_started",
            "llm_call_started",
            "llm_call_finished",
            "plan_updated",
            "answer_accepted",
            "round_finished",
            "run_finished",
        ]
    );

    let observation = model.last_message(1);
    assert!(observation.contains("Code executed:"));
    assert!(observation.contains("Output:\nloaded"));
    assert_eq!(result.metrics.llm_calls, 2);
    assert_eq!(result.metrics.executions, 1);
}

#[tokio::test]
async fn test_request_carries_protocol_and_stop_sequences() {
    let model = ScriptedModel::new(&[DONE_WITH_ANSWER]);
    let result = engine(&model, ScriptedEnvironment::new(vec![]), HitlMode::None)
        .run("Count rows")
        .await;
    assert!(result.is_success());

    let requests = model.requests.lock().unwrap();
    let first = &requests[0];
    assert_eq!(first.messages.len(), 2);
    assert!(first.messages[0].content.contains("<plan>"));
    assert_eq!(first.messages[1].content, "Task: Count rows");
    assert_eq!(first.stop, vec!["</code>", "</answer>"]);
}

#[tokio::test]
async fn test_early_answer_is_rejected() {
    let model = ScriptedModel::new(&[
        "<plan>\n1. [x] Load\n2. [ ] Plot\n</plan>\n<answer>too soon</answer>",
        "<plan>\n1. [x] Load\n2. [x] Plot\n</plan>\n<answer>all done</answer>",
    ]);
    let engine = engine(&model, ScriptedEnvironment::new(vec![]), HitlMode::None);
    let controller = engine.controller();

    let result = engine.run("task").await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.answer.as_deref(), Some("all done"));
    assert_eq!(result.metrics.answers_rejected, 1);
    assert!(model.last_message(1).contains(ANSWER_REMINDER));

    let events = controller.event_history();
    let rejected = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::AnswerRejected { answer, reason } => Some((answer.clone(), reason.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(rejected.0, "too soon");
    assert!(rejected.1.contains("1 plan step"));
}

#[tokio::test]
async fn test_empty_answer_does_not_complete() {
    let model = ScriptedModel::new(&[
        "<plan>\n1. [x] Load data\n</plan>\n<answer></answer>",
        DONE_WITH_ANSWER,
    ]);
    let engine = engine(&model, ScriptedEnvironment::new(vec![]), HitlMode::None);
    let controller = engine.controller();

    let result = engine.run("task").await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.answer.as_deref(), Some("3 rows"));
    assert_eq!(result.rounds.len(), 2);
    assert_eq!(count(&controller.event_history(), "answer_accepted"), 1);
}

#[tokio::test]
async fn test_answer_rejected_when_code_fails_in_same_response() {
    let model = ScriptedModel::new(&[
        "<plan>\n1. [x] Load\n</plan>\n<answer>done</answer>\n<code>\nboom()\n</code>",
        DONE_WITH_ANSWER,
    ]);
    let env = ScriptedEnvironment::new(vec![ExecutionResult::failure(
        ExecutionFailure::Code,
        "NameError: boom",
    )]);
    let result = engine(&model, env, HitlMode::None).run("task").await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.rounds.len(), 2);
    assert!(result.rounds[0].code_failed());
    assert_eq!(result.metrics.answers_rejected, 1);
}

#[tokio::test]
async fn test_plan_rejection_leaves_no_rounds() {
    let model = ScriptedModel::new(&[OPEN_PLAN_WITH_CODE]);
    let env = ScriptedEnvironment::new(vec![]);
    let probe = env.probe.clone();
    let handle = engine(&model, env, HitlMode::PlanOnly).spawn("task");

    let mut events = handle.controller.events();
    let awaiting = wait_for(&mut events, "hitl_awaiting_plan_approval").await;
    assert!(matches!(
        awaiting.payload,
        EventPayload::HitlAwaitingPlanApproval { ref plan, .. } if plan.total_steps() == 1
    ));
    assert!(handle.controller.pending().is_some());

    handle.controller.reject("bad plan").unwrap();
    let controller = handle.controller.clone();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.outcome, Outcome::Rejected);
    assert_eq!(result.reason, "bad plan");
    assert!(result.rounds.is_empty());
    assert!(probe.executed().is_empty());
    assert_eq!(model.request_count(), 1);
    assert_eq!(controller.state(), EngineState::Aborted);

    let history = controller.event_history();
    let tail: Vec<_> = kinds(&history).into_iter().rev().take(3).collect();
    assert_eq!(
        tail,
        vec!["run_finished", "hitl_execution_aborted", "hitl_plan_rejected"]
    );
    assert!(matches!(
        result.into_answer(),
        Err(crate::Error::HitlRejected { reason }) if reason == "bad plan"
    ));
}

#[tokio::test]
async fn test_plan_modification_replaces_plan() {
    let model = ScriptedModel::new(&[
        "<plan>\n1. [ ] Load\n2. [ ] Plot\n</plan>\n<code>\nprint(1)\n</code>",
        "<plan>\n1. [x] Summarise\n</plan>\n<answer>summary</answer>",
    ]);
    let env = ScriptedEnvironment::new(vec![]);
    let probe = env.probe.clone();
    let handle = engine(&model, env, HitlMode::PlanOnly).spawn("task");

    let mut events = handle.controller.events();
    wait_for(&mut events, "hitl_awaiting_plan_approval").await;
    assert!(matches!(
        handle.controller.modify_plan("no steps here"),
        Err(HitlError::InvalidPlan(_))
    ));
    handle.controller.modify_plan("1. [ ] Summarise").unwrap();

    let result = handle.wait().await.unwrap();
    assert_eq!(result.outcome, Outcome::Completed);
    assert!(probe.executed().is_empty());
    assert!(model.last_message(1).contains("A human reviewer replaced the plan"));
    assert!(model.last_message(1).contains("1. [ ] Summarise"));
}

#[tokio::test]
async fn test_feedback_reaches_next_request() {
    let model = ScriptedModel::new(&[OPEN_PLAN_WITH_CODE, DONE_WITH_ANSWER]);
    let handle = engine(&model, ScriptedEnvironment::new(vec![]), HitlMode::PlanOnly).spawn("task");

    let mut events = handle.controller.events();
    wait_for(&mut events, "hitl_awaiting_plan_approval").await;
    handle.controller.send_feedback("use the median").unwrap();
    handle.controller.approve(Some("looks fine".into())).unwrap();

    let feedback = wait_for(&mut events, "hitl_feedback_received").await;
    assert!(matches!(
        feedback.payload,
        EventPayload::HitlFeedbackReceived { ref feedback, .. } if feedback == "use the median"
    ));
    let approved = wait_for(&mut events, "hitl_plan_approved").await;
    assert!(matches!(
        approved.payload,
        EventPayload::HitlPlanApproved { note: Some(ref n) } if n == "looks fine"
    ));

    let result = handle.wait().await.unwrap();
    assert_eq!(result.outcome, Outcome::Completed);
    assert!(model.last_message(1).contains("Human feedback:\n- use the median"));
}

#[tokio::test]
async fn test_controller_without_pending_interaction() {
    let model = ScriptedModel::new(&[]);
    let engine = engine(&model, ScriptedEnvironment::new(vec![]), HitlMode::Full);
    let controller = engine.controller();

    assert_eq!(controller.approve(None), Err(HitlError::NoPendingInteraction));
    assert_eq!(
        controller.send_feedback("hello"),
        Err(HitlError::NoPendingInteraction)
    );
    assert_eq!(controller.state(), EngineState::Starting);
}

#[tokio::test]
async fn test_max_rounds_exceeded() {
    let model = ScriptedModel::repeating("<plan>\n1. [ ] Never done\n</plan>\n<code>\nx = 1\n</code>");
    let engine = Engine::builder()
        .llm(model.clone())
        .environment(ScriptedEnvironment::new(vec![]))
        .max_rounds(3)
        .build()
        .unwrap();
    let controller = engine.controller();

    let result = engine.run("task").await;

    assert_eq!(result.outcome, Outcome::MaxRoundsExceeded);
    assert_eq!(result.rounds.len(), 3);
    assert!(result.reason.contains("Max rounds (3)"));
    assert_eq!(model.request_count(), 3);
    assert_eq!(controller.state(), EngineState::Failed);

    let history = controller.event_history();
    assert!(history.last().unwrap().payload.is_terminal());
    assert!(matches!(
        result.into_answer(),
        Err(crate::Error::MaxRoundsExceeded { rounds: 3 })
    ));
}

#[tokio::test]
async fn test_timeout_reports_single_failure() {
    let model = ScriptedModel::new(&[OPEN_PLAN_WITH_CODE, DONE_WITH_ANSWER]);
    let env = ScriptedEnvironment::new(vec![ExecutionResult::failure(
        ExecutionFailure::Timeout,
        "execution exceeded 300s",
    )]);
    let engine = engine(&model, env, HitlMode::None);
    let controller = engine.controller();

    let result = engine.run("task").await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert!(result.rounds[0].result.as_ref().unwrap().is_timeout());
    assert_eq!(result.metrics.timeouts, 1);
    assert_eq!(count(&controller.event_history(), "code_failed"), 1);
    assert_eq!(count(&controller.event_history(), "environment_restarted"), 0);
    assert!(model.last_message(1).contains("Error (timeout)"));
}

#[tokio::test]
async fn test_crash_restarts_environment() {
    let model = ScriptedModel::new(&[OPEN_PLAN_WITH_CODE, OPEN_PLAN_WITH_CODE, DONE_WITH_ANSWER]);
    let env = ScriptedEnvironment::new(vec![
        ExecutionResult::failure(ExecutionFailure::Crash, "worker exited"),
        ExecutionResult::success("ok"),
    ]);
    let probe = env.probe.clone();
    let engine = engine(&model, env, HitlMode::None);
    let controller = engine.controller();

    let result = engine.run("task").await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.metrics.restarts, 1);
    assert_eq!(probe.starts(), 2);
    assert_eq!(count(&controller.event_history(), "environment_restarted"), 1);
    assert!(model.last_message(1).contains("was restarted"));
}

#[tokio::test]
async fn test_crash_budget_exhausted() {
    let model = ScriptedModel::repeating(OPEN_PLAN_WITH_CODE);
    let env = ScriptedEnvironment::new(vec![
        ExecutionResult::failure(ExecutionFailure::Crash, "worker exited"),
        ExecutionResult::failure(ExecutionFailure::Crash, "worker exited again"),
    ]);
    let result = engine(&model, env, HitlMode::None).run("task").await;

    assert_eq!(result.outcome, Outcome::Failed);
    assert_eq!(result.rounds.len(), 1);
    assert!(matches!(
        result.failure,
        Some(RunFailure::EnvironmentCrash { .. })
    ));
    assert!(matches!(
        result.into_answer(),
        Err(crate::Error::ExecutionCrash(_))
    ));
}

#[tokio::test]
async fn test_malformed_budget() {
    let model = ScriptedModel::repeating("<think>not sure yet</think>");
    let result = engine(&model, ScriptedEnvironment::new(vec![]), HitlMode::None)
        .run("task")
        .await;

    assert_eq!(result.outcome, Outcome::Failed);
    assert_eq!(
        result.failure,
        Some(RunFailure::MalformedResponses { attempts: 3 })
    );
    assert_eq!(result.rounds.len(), 2);
    assert_eq!(result.metrics.malformed_responses, 3);
}

#[tokio::test]
async fn test_malformed_streak_resets() {
    let model = ScriptedModel::new(&[
        "<think>hmm</think>",
        "<think>hmm</think>",
        OPEN_PLAN_WITH_CODE,
        "<plan></plan>",
        "<think>hmm</think>",
        DONE_WITH_ANSWER,
    ]);
    let result = engine(&model, ScriptedEnvironment::new(vec![]), HitlMode::None)
        .run("task")
        .await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.metrics.malformed_responses, 4);
    assert!(model.last_message(4).contains("could not be parsed"));
}

#[tokio::test]
async fn test_tool_calls_are_observed() {
    let tools = ToolManager::new();
    tools
        .register(Arc::new(EchoServer), Duration::from_secs(5))
        .await
        .unwrap();

    let model = ScriptedModel::new(&[
        "<plan>\n1. [ ] Ask tools\n</plan>\n<tool_call>{\"name\": \"util__fail\", \"arguments\": {}}</tool_call>\n<tool_call>{\"name\": \"util__echo\", \"arguments\": {\"text\": \"hi\"}}</tool_call>\n<tool_call>{oops}</tool_call>",
        "<plan>\n1. [x] Ask tools\n</plan>\n<answer>hi</answer>",
    ]);
    let engine = Engine::builder()
        .llm(model.clone())
        .environment(ScriptedEnvironment::new(vec![]))
        .tools(Arc::new(tools))
        .build()
        .unwrap();
    let controller = engine.controller();

    let result = engine.run("task").await;

    assert_eq!(result.outcome, Outcome::Completed);
    let calls = &result.rounds[0].tool_calls;
    assert_eq!(calls.len(), 2);
    assert!(calls[0].is_error);
    assert!(!calls[1].is_error);
    assert_eq!(calls[1].output, "hi");
    assert_eq!(result.metrics.tool_errors, 1);

    let observation = model.last_message(1);
    assert!(observation.contains("Tool `util__fail` failed"));
    assert!(observation.contains("Tool `util__echo` returned:\nhi"));
    assert!(observation.contains("Invalid tool call"));

    let system = model.requests.lock().unwrap()[0].messages[0].content.clone();
    assert!(system.contains("util__echo"));
    assert_eq!(count(&controller.event_history(), "tool_call_finished"), 2);
}

#[tokio::test]
async fn test_tool_call_without_manager() {
    let model = ScriptedModel::new(&[
        "<plan>\n1. [ ] Use tool\n</plan>\n<tool_call>{\"name\": \"files__read\"}</tool_call>",
        "<plan>\n1. [x] Use tool\n</plan>\n<answer>none</answer>",
    ]);
    let result = engine(&model, ScriptedEnvironment::new(vec![]), HitlMode::None)
        .run("task")
        .await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert!(result.rounds[0].tool_calls[0].is_error);
    assert!(model.last_message(1).contains("Tool `files__read` failed"));
}

#[tokio::test]
async fn test_error_guidance_modify_code() {
    let model = ScriptedModel::new(&[
        "<plan>\n1. [ ] Print\n</plan>\n<code>\nprint(y)\n</code>",
        "<plan>\n1. [x] Print\n</plan>\n<answer>printed</answer>",
    ]);
    let env = ScriptedEnvironment::new(vec![
        ExecutionResult::failure(ExecutionFailure::Code, "NameError: name 'y' is not defined"),
        ExecutionResult::success("1"),
    ]);
    let probe = env.probe.clone();
    let handle = engine(&model, env, HitlMode::OnError).spawn("task");

    let mut events = handle.controller.events();
    let awaiting = wait_for(&mut events, "hitl_awaiting_error_guidance").await;
    assert!(matches!(
        awaiting.payload,
        EventPayload::HitlAwaitingErrorGuidance { ref error, .. } if error.contains("NameError")
    ));
    assert!(matches!(
        handle.controller.modify_plan("1. [ ] other"),
        Err(HitlError::InvalidAction { .. })
    ));
    handle.controller.modify_code("y = 1\nprint(y)").unwrap();

    let result = handle.wait().await.unwrap();
    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(probe.executed(), vec!["print(y)", "y = 1\nprint(y)"]);
    assert_eq!(result.rounds[0].code.as_deref(), Some("y = 1\nprint(y)"));
    assert!(result.rounds[0].result.as_ref().unwrap().success);
}

#[tokio::test]
async fn test_full_mode_skip_code() {
    let model = ScriptedModel::new(&[OPEN_PLAN_WITH_CODE, DONE_WITH_ANSWER]);
    let env = ScriptedEnvironment::new(vec![]);
    let probe = env.probe.clone();
    let handle = engine(&model, env, HitlMode::Full).spawn("task");

    let mut events = handle.controller.events();
    wait_for(&mut events, "hitl_awaiting_plan_approval").await;
    handle.controller.approve(None).unwrap();
    wait_for(&mut events, "hitl_awaiting_code_approval").await;
    handle.controller.skip().unwrap();
    wait_for(&mut events, "hitl_step_skipped").await;
    wait_for(&mut events, "hitl_awaiting_answer_approval").await;
    handle.controller.approve(None).unwrap();

    let result = handle.wait().await.unwrap();
    assert_eq!(result.outcome, Outcome::Completed);
    assert!(probe.executed().is_empty());
    assert!(model.last_message(1).contains("skipped"));
}

#[tokio::test]
async fn test_abort_while_awaiting() {
    let model = ScriptedModel::new(&[OPEN_PLAN_WITH_CODE]);
    let handle = engine(&model, ScriptedEnvironment::new(vec![]), HitlMode::PlanOnly).spawn("task");

    let mut events = handle.controller.events();
    wait_for(&mut events, "hitl_awaiting_plan_approval").await;
    handle.controller.abort("review deadline passed");

    let result = handle.wait().await.unwrap();
    assert_eq!(result.outcome, Outcome::Rejected);
    assert_eq!(result.reason, "review deadline passed");
}

#[tokio::test]
async fn test_cancel_while_awaiting() {
    let model = ScriptedModel::new(&[OPEN_PLAN_WITH_CODE]);
    let handle = engine(&model, ScriptedEnvironment::new(vec![]), HitlMode::PlanOnly).spawn("task");

    let mut events = handle.controller.events();
    wait_for(&mut events, "hitl_awaiting_plan_approval").await;
    handle.controller.cancel();

    let controller = handle.controller.clone();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.outcome, Outcome::Aborted);
    assert!(result.rounds.is_empty());
    assert_eq!(controller.wait_finished().await, EngineState::Aborted);
    assert!(controller.pending().is_none());
    assert!(matches!(result.into_answer(), Err(crate::Error::Cancelled(_))));
}

#[tokio::test]
async fn test_cancel_during_execution() {
    let model = ScriptedModel::new(&[OPEN_PLAN_WITH_CODE]);
    let env = ScriptedEnvironment::blocking();
    let probe = env.probe.clone();
    let handle = engine(&model, env, HitlMode::None).spawn("task");

    let mut events = handle.controller.events();
    wait_for(&mut events, "code_executing").await;
    handle.controller.cancel();

    let controller = handle.controller.clone();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.outcome, Outcome::Aborted);
    assert!(result.rounds.is_empty());
    assert_eq!(probe.executed(), vec!["df = load()"]);
    assert_eq!(controller.state(), EngineState::Aborted);

    let history = controller.event_history();
    assert_eq!(count(&history, "code_failed"), 1);
    let failure = history.iter().find_map(|e| match &e.payload {
        EventPayload::CodeFailed { failure, .. } => Some(*failure),
        _ => None,
    });
    assert_eq!(failure, Some(ExecutionFailure::Cancelled));
    assert_eq!(count(&history, "environment_restarted"), 0);
    assert_eq!(history.last().unwrap().kind(), "run_finished");
}

#[tokio::test]
async fn test_cancel_during_model_call() {
    let model = ScriptedModel::hanging();
    let env = ScriptedEnvironment::new(vec![]);
    let probe = env.probe.clone();
    let handle = engine(&model, env, HitlMode::None).spawn("task");

    let mut events = handle.controller.events();
    wait_for(&mut events, "llm_call_started").await;
    handle.controller.cancel();

    let controller = handle.controller.clone();
    let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("run did not stop after cancel")
        .unwrap();
    assert_eq!(result.outcome, Outcome::Aborted);
    assert!(result.rounds.is_empty());
    assert_eq!(result.metrics.llm_calls, 0);
    assert!(probe.executed().is_empty());
    assert_eq!(controller.state(), EngineState::Aborted);

    let history = controller.event_history();
    assert_eq!(count(&history, "llm_call_finished"), 0);
    assert_eq!(count(&history, "run_error"), 0);
    assert!(matches!(result.into_answer(), Err(crate::Error::Cancelled(_))));
}

#[tokio::test]
async fn test_model_error_fails_run() {
    let model = ScriptedModel::failing(LlmError::Api {
        status: 401,
        message: "invalid api key".into(),
    });
    let engine = engine(&model, ScriptedEnvironment::new(vec![]), HitlMode::None);
    let controller = engine.controller();

    let result = engine.run("task").await;

    assert_eq!(result.outcome, Outcome::Failed);
    assert!(matches!(result.failure, Some(RunFailure::Model(_))));
    assert_eq!(count(&controller.event_history(), "run_error"), 1);
    assert_eq!(controller.state(), EngineState::Failed);
    assert!(matches!(
        result.into_answer(),
        Err(crate::Error::Llm(LlmError::Api { status: 401, .. }))
    ));
}

#[tokio::test]
async fn test_unopenable_checkpoint_fails_run() {
    let model = ScriptedModel::new(&[OPEN_PLAN_WITH_CODE]);
    let env = ScriptedEnvironment::new(vec![ExecutionResult::success("loaded")]);
    let probe = env.probe.clone();
    let engine = engine(&model, env, HitlMode::PlanOnly);
    let controller = engine.controller();

    let stale = InteractionPayload::Plan {
        plan: Plan::parse("1. [ ] Stale step").unwrap(),
    };
    let _held = engine
        .gateway
        .open(Checkpoint::PlanApproval, stale)
        .unwrap()
        .unwrap();

    let result = engine.run("task").await;

    assert_eq!(result.outcome, Outcome::Failed);
    assert!(matches!(
        result.failure,
        Some(RunFailure::Checkpoint { .. })
    ));
    assert!(probe.executed().is_empty());
    assert_eq!(controller.state(), EngineState::Failed);
    let history = controller.event_history();
    assert_eq!(count(&history, "hitl_awaiting_plan_approval"), 0);
    assert_eq!(count(&history, "run_error"), 1);
    assert!(matches!(
        result.into_answer(),
        Err(crate::Error::CheckpointUnavailable(_))
    ));
}

#[tokio::test]
async fn test_environment_start_failure() {
    let model = ScriptedModel::new(&[DONE_WITH_ANSWER]);
    let result = engine(&model, ScriptedEnvironment::failing_start(), HitlMode::None)
        .run("task")
        .await;

    assert_eq!(result.outcome, Outcome::Failed);
    assert!(matches!(
        result.failure,
        Some(RunFailure::EnvironmentStart { .. })
    ));
    assert_eq!(model.request_count(), 0);
}

#[tokio::test]
async fn test_resume_from_snapshot() {
    let first = ScriptedModel::repeating(OPEN_PLAN_WITH_CODE);
    let interrupted = Engine::builder()
        .llm(first.clone())
        .environment(ScriptedEnvironment::new(vec![]))
        .max_rounds(1)
        .build()
        .unwrap()
        .run("task")
        .await;
    assert_eq!(interrupted.outcome, Outcome::MaxRoundsExceeded);

    let snapshot = RunSnapshot::from(&interrupted);
    let model = ScriptedModel::new(&[DONE_WITH_ANSWER]);
    let engine = engine(&model, ScriptedEnvironment::new(vec![]), HitlMode::None);
    let controller = engine.controller();

    let result = engine.resume(snapshot).await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.rounds.len(), 2);
    assert_eq!(result.rounds[1].index, 2);
    assert_eq!(model.requests.lock().unwrap()[0].messages.len(), 4);
    assert!(controller.event_history().iter().any(|e| matches!(
        e.payload,
        EventPayload::RoundStarted { round: 2, .. }
    )));
}

#[tokio::test]
async fn test_events_journaled_to_run_context() {
    let dir = tempfile::tempdir().unwrap();
    let context = RunContext::create(dir.path(), Some("run-journal".into()))
        .await
        .unwrap();
    let log_path = context.events_log_path();

    let model = ScriptedModel::new(&[DONE_WITH_ANSWER]);
    let engine = Engine::builder()
        .llm(model.clone())
        .environment(ScriptedEnvironment::new(vec![]))
        .context(Arc::new(context))
        .build()
        .unwrap();
    let controller = engine.controller();
    assert_eq!(controller.run_id(), "run-journal");

    let result = engine.run("task").await;
    assert_eq!(result.run_id, "run-journal");

    let text = tokio::fs::read_to_string(&log_path).await.unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), controller.event_history().len());
    assert!(lines[0].contains("\"type\":\"run_started\""));
    assert!(lines.last().unwrap().contains("\"type\":\"run_finished\""));
}

#[test]
fn test_builder_requires_collaborators() {
    assert!(matches!(
        Engine::builder().build(),
        Err(crate::Error::Config(_))
    ));

    let model = ScriptedModel::new(&[]);
    assert!(matches!(
        Engine::builder()
            .llm(model.clone())
            .environment(ScriptedEnvironment::new(vec![]))
            .max_rounds(0)
            .build(),
        Err(crate::Error::Config(_))
    ));
}
