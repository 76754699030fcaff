//! The round loop.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::controller::{RunController, RunHandle};
use super::prompt::{
    ANSWER_REMINDER, CONTINUE_PROMPT, FAILED_CODE_REMINDER, SKIPPED_CODE_NOTICE, format_execution,
    format_tool_result, system_prompt, task_message,
};
use super::{
    EngineConfig, EngineState, Outcome, Round, RunFailure, RunMetrics, RunResult, RunSnapshot,
    ToolCallRecord,
};
use crate::config::ConfigError;
use crate::context::{RunContext, generate_run_id};
use crate::events::{EventJournal, EventLog, EventPayload};
use crate::execution::{ExecutionEnvironment, ExecutionFailure, ExecutionResult};
use crate::hitl::{
    Checkpoint, GatewaySignal, HitlError, HitlGateway, HitlMode, InteractionPayload, Resolution,
};
use crate::llm::{LanguageModel, LlmRequest, Message};
use crate::plan::{ParsedResponse, Plan, ToolCallRequest};
use crate::tools::{ToolError, ToolManager};

const PREVIEW_CHARS: usize = 200;

/// Why the loop stopped. Carried through `Err` so helpers can end the run with `?`.
struct Stop {
    outcome: Outcome,
    reason: String,
    answer: Option<String>,
    failure: Option<RunFailure>,
}

impl Stop {
    fn new(outcome: Outcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
            answer: None,
            failure: None,
        }
    }

    fn completed(answer: String) -> Self {
        Self {
            answer: Some(answer),
            ..Self::new(Outcome::Completed, "answer accepted")
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self::new(Outcome::Rejected, reason)
    }

    fn aborted(reason: impl Into<String>) -> Self {
        Self::new(Outcome::Aborted, reason)
    }

    fn failed(failure: RunFailure) -> Self {
        Self {
            failure: Some(failure.clone()),
            ..Self::new(Outcome::Failed, failure.to_string())
        }
    }

    fn max_rounds(rounds: u32) -> Self {
        Self::new(
            Outcome::MaxRoundsExceeded,
            format!("Max rounds ({rounds}) reached without completion."),
        )
    }
}

/// Mutable state of one run.
struct RunState {
    task: String,
    messages: Vec<Message>,
    plan: Option<Plan>,
    rounds: Vec<Round>,
    metrics: RunMetrics,
    feedback: Vec<String>,
    notices: Vec<String>,
    malformed_streak: u32,
    next_round: usize,
    started_at: DateTime<Utc>,
}

impl RunState {
    fn new(task: String, system: String) -> Self {
        let messages = vec![Message::system(system), Message::user(task_message(&task))];
        Self {
            task,
            messages,
            plan: None,
            rounds: Vec::new(),
            metrics: RunMetrics::default(),
            feedback: Vec::new(),
            notices: Vec::new(),
            malformed_streak: 0,
            next_round: 1,
            started_at: Utc::now(),
        }
    }

    fn resume(snapshot: RunSnapshot, system: String) -> Self {
        Self {
            messages: snapshot.messages(&system),
            next_round: snapshot.next_round(),
            task: snapshot.task,
            plan: snapshot.plan,
            rounds: snapshot.rounds,
            metrics: snapshot.metrics,
            feedback: Vec::new(),
            notices: Vec::new(),
            malformed_streak: 0,
            started_at: Utc::now(),
        }
    }
}

enum CodeRun {
    Executed {
        code: String,
        result: ExecutionResult,
    },
    Skipped {
        code: String,
        result: Option<ExecutionResult>,
    },
}

pub struct Engine {
    run_id: String,
    llm: Arc<dyn LanguageModel>,
    environment: Mutex<Box<dyn ExecutionEnvironment>>,
    tools: Option<Arc<ToolManager>>,
    config: EngineConfig,
    context: Option<Arc<RunContext>>,
    pub(super) gateway: Arc<HitlGateway>,
    events: Arc<EventLog>,
    cancel: CancellationToken,
    state: watch::Sender<EngineState>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("run_id", &self.run_id)
            .field("model", &self.llm.name())
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn controller(&self) -> RunController {
        RunController::new(
            self.run_id.clone(),
            Arc::clone(&self.gateway),
            Arc::clone(&self.events),
            self.cancel.clone(),
            self.state.subscribe(),
        )
    }

    pub async fn run(self, task: impl Into<String>) -> RunResult {
        let state = RunState::new(task.into(), self.system_prompt());
        self.drive(state).await
    }

    /// Continue a run from a snapshot. Rounds are numbered on from the
    /// snapshot's last round and count against the same `max_rounds`.
    pub async fn resume(self, snapshot: RunSnapshot) -> RunResult {
        let state = RunState::resume(snapshot, self.system_prompt());
        self.drive(state).await
    }

    pub fn spawn(self, task: impl Into<String>) -> RunHandle {
        let controller = self.controller();
        let task = task.into();
        let join = tokio::spawn(async move { self.run(task).await });
        RunHandle { controller, join }
    }

    pub fn spawn_resume(self, snapshot: RunSnapshot) -> RunHandle {
        let controller = self.controller();
        let join = tokio::spawn(async move { self.resume(snapshot).await });
        RunHandle { controller, join }
    }

    fn system_prompt(&self) -> String {
        let tools = self
            .tools
            .as_ref()
            .map(|t| t.list_tools())
            .unwrap_or_default();
        system_prompt(&tools)
    }

    #[instrument(skip_all, fields(run_id = %self.run_id))]
    async fn drive(self, mut state: RunState) -> RunResult {
        let journal = self
            .context
            .as_ref()
            .map(|ctx| EventJournal::new(ctx.events_log_path()).spawn(self.events.subscribe()));

        self.events.publish(EventPayload::RunStarted {
            run_id: self.run_id.clone(),
            task: state.task.clone(),
            hitl_mode: self.config.hitl_mode.to_string(),
            max_rounds: self.config.max_rounds as usize,
        });
        info!(
            model = self.llm.name(),
            hitl_mode = %self.config.hitl_mode,
            max_rounds = self.config.max_rounds,
            "run started"
        );

        let stop = match self.start_environment().await {
            Ok(()) => {
                self.state.send_replace(EngineState::Running);
                self.rounds(&mut state).await
            }
            Err(stop) => stop,
        };
        let result = self.finish(state, stop).await;

        if let Some(handle) = journal {
            match handle.await {
                Ok(Ok(written)) => debug!(events = written, "event journal written"),
                Ok(Err(e)) => warn!(error = %e, "event journal failed"),
                Err(e) => warn!(error = %e, "event journal task failed"),
            }
        }
        result
    }

    async fn start_environment(&self) -> Result<(), Stop> {
        let mut env = self.environment.lock().await;
        if env.is_alive() {
            return Ok(());
        }
        env.start().await.map_err(|e| {
            warn!(environment = env.name(), error = %e, "environment failed to start");
            self.events.publish(EventPayload::RunError {
                message: e.to_string(),
            });
            Stop::failed(RunFailure::EnvironmentStart {
                message: e.to_string(),
            })
        })
    }

    async fn rounds(&self, state: &mut RunState) -> Stop {
        let max_rounds = self.config.max_rounds as usize;
        while state.next_round <= max_rounds {
            let index = state.next_round;
            state.next_round += 1;
            if let Err(stop) = self.round(state, index).await {
                return stop;
            }
        }
        Stop::max_rounds(self.config.max_rounds)
    }

    fn check_interrupted(&self) -> Result<(), Stop> {
        if self.cancel.is_cancelled() {
            return Err(Stop::aborted("run cancelled"));
        }
        if self.gateway.is_aborted() {
            let reason = self.gateway.abort_reason().unwrap_or_default();
            return Err(self.hitl_aborted(reason));
        }
        Ok(())
    }

    fn hitl_aborted(&self, reason: String) -> Stop {
        self.events.publish(EventPayload::HitlExecutionAborted {
            reason: reason.clone(),
        });
        Stop::rejected(reason)
    }

    async fn round(&self, state: &mut RunState, index: usize) -> Result<(), Stop> {
        self.check_interrupted()?;

        let started_at = Utc::now();
        let clock = Instant::now();
        self.events.publish(EventPayload::RoundStarted {
            round: index,
            max_rounds: self.config.max_rounds as usize,
        });
        debug!(round = index, "round started");

        let request_messages = state.messages.len();
        let text = self.call_model(state, index).await?;
        let parsed = ParsedResponse::parse(&text);

        let mut round = Round {
            index,
            request_messages,
            response: text,
            code: None,
            result: None,
            tool_calls: Vec::new(),
            observation: String::new(),
            started_at,
            finished_at: started_at,
        };

        if parsed.is_malformed() {
            state.malformed_streak += 1;
            state.metrics.record_malformed();
            warn!(round = index, streak = state.malformed_streak, "malformed model response");

            if state.malformed_streak > self.config.malformed_retry_budget {
                let failure = RunFailure::MalformedResponses {
                    attempts: state.malformed_streak,
                };
                self.events.publish(EventPayload::RunError {
                    message: failure.to_string(),
                });
                return Err(Stop::failed(failure));
            }

            let notice = match &parsed.plan_error {
                Some(e) => format!(
                    "Your plan could not be parsed ({e}). Write it as a numbered checklist, for example `1. [ ] Load the data`."
                ),
                None => format!(
                    "Your response had no plan, code, tool call or answer. {CONTINUE_PROMPT}"
                ),
            };
            self.finish_round(state, round, vec![notice], clock);
            return Ok(());
        }
        state.malformed_streak = 0;

        let mut notes = Vec::new();

        if let Some(proposed) = parsed.plan.clone()
            && let Some(replaced) = self
                .track_plan(state, proposed, parsed.plan_update.clone())
                .await?
        {
            notes.push(format!(
                "A human reviewer replaced the plan. Continue from the first open step:\n{}",
                replaced.to_checklist()
            ));
            self.finish_round(state, round, notes, clock);
            return Ok(());
        }

        for call in &parsed.tool_calls {
            let (record, note) = self.call_tool(index, call).await?;
            state.metrics.record_tool_call(record.is_error);
            round.tool_calls.push(record);
            notes.push(note);
        }
        for error in &parsed.tool_call_errors {
            notes.push(format!("Invalid tool call: {error}"));
        }

        let mut code_failed = false;
        if let Some(code) = parsed.code.clone() {
            match self.run_code(state, index, code).await? {
                CodeRun::Executed { code, result } => {
                    code_failed = !result.success;
                    notes.push(format_execution(&code, &result, self.config.max_output_chars));
                    round.code = Some(code);
                    round.result = Some(result);
                }
                CodeRun::Skipped { code, result } => {
                    if let Some(result) = &result {
                        notes.push(format_execution(&code, result, self.config.max_output_chars));
                    }
                    notes.push(SKIPPED_CODE_NOTICE.to_string());
                    round.code = Some(code);
                    round.result = result;
                }
            }
        }

        if let Some(answer) = parsed.final_answer().map(str::to_string) {
            let open_steps = state
                .plan
                .as_ref()
                .map_or(0, |p| p.total_steps() - p.completed_steps());

            if open_steps == 0 && !code_failed {
                match self
                    .checkpoint(
                        state,
                        Checkpoint::AnswerApproval,
                        InteractionPayload::Answer {
                            answer: answer.clone(),
                        },
                    )
                    .await?
                {
                    Some(Resolution::Rejected { reason }) => return Err(self.hitl_aborted(reason)),
                    Some(Resolution::Approved { note }) => {
                        self.events
                            .publish(EventPayload::HitlAnswerApproved { note });
                    }
                    Some(_) | None => {}
                }

                self.events.publish(EventPayload::AnswerAccepted {
                    answer: answer.clone(),
                });
                info!(round = index, "answer accepted");
                self.finish_round(state, round, notes, clock);
                return Err(Stop::completed(answer));
            }

            let (reason, reminder) = if open_steps > 0 {
                (format!("{open_steps} plan step(s) still open"), ANSWER_REMINDER)
            } else {
                ("code in the same response failed".to_string(), FAILED_CODE_REMINDER)
            };
            info!(round = index, %reason, "answer rejected");
            state.metrics.record_answer_rejected();
            self.events
                .publish(EventPayload::AnswerRejected { answer, reason });
            notes.push(reminder.to_string());
        }

        if notes.is_empty() {
            notes.push(CONTINUE_PROMPT.to_string());
        }
        self.finish_round(state, round, notes, clock);
        Ok(())
    }

    fn finish_round(&self, state: &mut RunState, mut round: Round, notes: Vec<String>, clock: Instant) {
        let mut parts = notes;
        parts.append(&mut state.notices);
        if !state.feedback.is_empty() {
            let lines: Vec<String> = state.feedback.drain(..).map(|f| format!("- {f}")).collect();
            parts.push(format!("Human feedback:\n{}", lines.join("\n")));
        }

        round.observation = parts.join("\n\n");
        round.finished_at = Utc::now();
        state.messages.push(Message::assistant(&round.response));
        state.messages.push(Message::user(&round.observation));
        state.metrics.record_round();

        self.events.publish(EventPayload::RoundFinished {
            round: round.index,
            duration_ms: clock.elapsed().as_millis() as u64,
        });
        state.rounds.push(round);
    }

    async fn call_model(&self, state: &mut RunState, index: usize) -> Result<String, Stop> {
        let mut request =
            LlmRequest::new(state.messages.clone()).with_stop(self.config.stop_sequences.clone());
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        self.events.publish(EventPayload::LlmCallStarted {
            round: index,
            messages: request.messages.len(),
        });

        let clock = Instant::now();
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Stop::aborted("run cancelled")),
            response = self.llm.complete(&request) => response,
        };
        let latency = clock.elapsed();

        match response {
            Ok(text) => {
                state.metrics.record_llm_call(latency);
                self.events.publish(EventPayload::LlmCallFinished {
                    round: index,
                    latency_ms: latency.as_millis() as u64,
                    preview: text.chars().take(PREVIEW_CHARS).collect(),
                });
                debug!(round = index, latency_ms = latency.as_millis() as u64, "model responded");
                Ok(text)
            }
            Err(e) => {
                warn!(round = index, error = %e, "model call failed");
                self.events.publish(EventPayload::RunError {
                    message: e.to_string(),
                });
                Err(Stop::failed(RunFailure::Model(e)))
            }
        }
    }

    /// Merge `proposed` into the tracked plan and open plan approval when the
    /// structure changed. Returns the plan a human substituted, if any.
    async fn track_plan(
        &self,
        state: &mut RunState,
        proposed: Plan,
        reason: Option<String>,
    ) -> Result<Option<Plan>, Stop> {
        let merged = match &state.plan {
            Some(old) => Plan::merge(old, proposed),
            None => proposed,
        };
        let needs_review = state
            .plan
            .as_ref()
            .is_none_or(|old| !old.same_structure(&merged));

        match &state.plan {
            None => {
                info!(steps = merged.total_steps(), "plan created");
                self.events.publish(EventPayload::PlanCreated {
                    plan: merged.clone(),
                });
            }
            Some(old) if old.steps() != merged.steps() => {
                debug!(
                    completed = merged.completed_steps(),
                    total = merged.total_steps(),
                    "plan updated"
                );
                self.events.publish(EventPayload::PlanUpdated {
                    plan: merged.clone(),
                    reason,
                });
            }
            Some(_) => {}
        }
        state.plan = Some(merged.clone());

        if !needs_review {
            return Ok(None);
        }

        let payload = InteractionPayload::Plan { plan: merged };
        match self.checkpoint(state, Checkpoint::PlanApproval, payload).await? {
            Some(Resolution::Approved { note }) => {
                self.events.publish(EventPayload::HitlPlanApproved { note });
                Ok(None)
            }
            Some(Resolution::PlanModified(plan)) => {
                info!(steps = plan.total_steps(), "plan replaced by reviewer");
                self.events.publish(EventPayload::HitlPlanModified { plan: plan.clone() });
                state.plan = Some(plan.clone());
                Ok(Some(plan))
            }
            Some(Resolution::Rejected { reason }) => {
                self.events.publish(EventPayload::HitlPlanRejected {
                    reason: reason.clone(),
                });
                Err(self.hitl_aborted(reason))
            }
            Some(_) | None => Ok(None),
        }
    }

    async fn run_code(
        &self,
        state: &mut RunState,
        index: usize,
        mut code: String,
    ) -> Result<CodeRun, Stop> {
        let payload = InteractionPayload::Code { code: code.clone() };
        match self.checkpoint(state, Checkpoint::CodeApproval, payload).await? {
            Some(Resolution::Approved { note }) => {
                self.events.publish(EventPayload::HitlCodeApproved { note });
            }
            Some(Resolution::CodeModified(modified)) => {
                self.events.publish(EventPayload::HitlCodeModified {
                    code: modified.clone(),
                });
                code = modified;
            }
            Some(Resolution::Skipped) => {
                self.events.publish(EventPayload::HitlStepSkipped { round: index });
                return Ok(CodeRun::Skipped { code, result: None });
            }
            Some(Resolution::Rejected { reason }) => return Err(self.hitl_aborted(reason)),
            Some(Resolution::PlanModified(_)) | None => {}
        }

        loop {
            let result = self.execute(state, index, &code).await?;
            if result.success {
                return Ok(CodeRun::Executed { code, result });
            }

            let payload = InteractionPayload::Error {
                code: code.clone(),
                error: result.error_summary(),
            };
            match self.checkpoint(state, Checkpoint::ErrorGuidance, payload).await? {
                Some(Resolution::CodeModified(modified)) => {
                    self.events.publish(EventPayload::HitlCodeModified {
                        code: modified.clone(),
                    });
                    code = modified;
                }
                Some(Resolution::Skipped) => {
                    self.events.publish(EventPayload::HitlStepSkipped { round: index });
                    return Ok(CodeRun::Skipped {
                        code,
                        result: Some(result),
                    });
                }
                Some(Resolution::Rejected { reason }) => return Err(self.hitl_aborted(reason)),
                Some(Resolution::Approved { note }) => {
                    state.feedback.extend(note);
                    return Ok(CodeRun::Executed { code, result });
                }
                Some(Resolution::PlanModified(_)) | None => {
                    return Ok(CodeRun::Executed { code, result });
                }
            }
        }
    }

    async fn execute(
        &self,
        state: &mut RunState,
        index: usize,
        code: &str,
    ) -> Result<ExecutionResult, Stop> {
        self.events.publish(EventPayload::CodeExecuting {
            round: index,
            code: code.to_string(),
        });

        let mut env = self.environment.lock().await;
        let result = env
            .execute(code, self.config.code_timeout, &self.cancel)
            .await;
        state.metrics.record_execution(&result);

        if result.success {
            debug!(round = index, duration_ms = result.duration_ms, "code executed");
            self.events.publish(EventPayload::CodeSuccess {
                round: index,
                output: result.output.clone(),
                artifacts: result.artifacts.clone(),
                duration_ms: result.duration_ms,
            });
            return Ok(result);
        }

        let failure = result.failure.unwrap_or(ExecutionFailure::Code);
        warn!(round = index, %failure, "code execution failed");
        self.events.publish(EventPayload::CodeFailed {
            round: index,
            failure,
            error: result.error_output.clone(),
            output: result.output.clone(),
            duration_ms: result.duration_ms,
        });

        if result.is_cancelled() {
            return Err(Stop::aborted("run cancelled"));
        }

        if result.is_crash() || !env.is_alive() {
            let reason = result.error_summary();
            if state.metrics.restarts >= self.config.environment_restart_budget {
                self.events.publish(EventPayload::RunError {
                    message: format!("execution environment lost: {reason}"),
                });
                return Err(Stop::failed(RunFailure::EnvironmentCrash { message: reason }));
            }

            if let Err(e) = env.restart().await {
                self.events.publish(EventPayload::RunError {
                    message: e.to_string(),
                });
                return Err(Stop::failed(RunFailure::EnvironmentCrash {
                    message: e.to_string(),
                }));
            }
            state.metrics.record_restart();
            warn!(
                round = index,
                restarts = state.metrics.restarts,
                "execution environment restarted"
            );
            self.events.publish(EventPayload::EnvironmentRestarted {
                round: index,
                reason,
                restarts: state.metrics.restarts,
            });
            state.notices.push(
                "The execution environment was restarted. Variables, imports and loaded data from earlier steps are gone."
                    .to_string(),
            );
        }

        Ok(result)
    }

    async fn call_tool(
        &self,
        index: usize,
        call: &ToolCallRequest,
    ) -> Result<(ToolCallRecord, String), Stop> {
        self.events.publish(EventPayload::ToolCallStarted {
            round: index,
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let clock = Instant::now();
        let result = match &self.tools {
            Some(tools) => tokio::select! {
                _ = self.cancel.cancelled() => return Err(Stop::aborted("run cancelled")),
                result = tools.invoke(&call.name, call.arguments.clone()) => result,
            },
            None => Err(ToolError::not_found(&call.name)),
        };
        let duration_ms = clock.elapsed().as_millis() as u64;

        let (output, is_error) = match &result {
            Ok(output) => (output.to_text(), output.is_error),
            Err(e) => (e.to_string(), true),
        };
        if is_error {
            warn!(round = index, tool = %call.name, error = %output, "tool call failed");
        }
        self.events.publish(EventPayload::ToolCallFinished {
            round: index,
            name: call.name.clone(),
            output: output.clone(),
            is_error,
            duration_ms,
        });

        let note = format_tool_result(&call.name, &result, self.config.max_output_chars);
        let record = ToolCallRecord {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            output,
            is_error,
            duration_ms,
        };
        Ok((record, note))
    }

    /// Suspend on a HITL checkpoint until it is resolved.
    ///
    /// Returns `Ok(None)` when the mode does not enable `checkpoint`. An enabled
    /// checkpoint that cannot be opened fails the run. Feedback arriving while
    /// suspended is queued for the next request.
    async fn checkpoint(
        &self,
        state: &mut RunState,
        checkpoint: Checkpoint,
        payload: InteractionPayload,
    ) -> Result<Option<Resolution>, Stop> {
        let mut wait = match self.gateway.open(checkpoint, payload.clone()) {
            Ok(Some(wait)) => wait,
            Ok(None) => return Ok(None),
            Err(HitlError::Aborted(reason)) => return Err(self.hitl_aborted(reason)),
            Err(e) => {
                warn!(%checkpoint, error = %e, "checkpoint could not be opened");
                self.events.publish(EventPayload::RunError {
                    message: format!("{checkpoint} checkpoint could not be opened: {e}"),
                });
                return Err(Stop::failed(RunFailure::Checkpoint {
                    message: e.to_string(),
                }));
            }
        };

        let interaction_id = wait.interaction.id.clone();
        self.events.publish(awaiting_event(interaction_id.clone(), payload));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Stop::aborted("run cancelled while awaiting human input"));
                }
                signal = wait.next() => match signal {
                    Some(GatewaySignal::Feedback(feedback)) => {
                        self.events.publish(EventPayload::HitlFeedbackReceived {
                            interaction_id: interaction_id.clone(),
                            feedback: feedback.clone(),
                        });
                        state.feedback.push(feedback);
                    }
                    Some(GatewaySignal::Resolved(resolution)) => return Ok(Some(resolution)),
                    None => return Err(Stop::aborted("human input channel closed")),
                },
            }
        }
    }

    async fn finish(&self, state: RunState, stop: Stop) -> RunResult {
        self.gateway.close();
        {
            let mut env = self.environment.lock().await;
            if let Err(e) = env.shutdown().await {
                warn!(environment = env.name(), error = %e, "environment shutdown failed");
            }
        }

        if stop.outcome.is_success() {
            info!(rounds = state.rounds.len(), "run completed");
        } else {
            warn!(outcome = %stop.outcome, reason = %stop.reason, rounds = state.rounds.len(), "run ended");
        }

        self.events.publish(EventPayload::RunFinished {
            outcome: stop.outcome,
            reason: Some(stop.reason.clone()),
            answer: stop.answer.clone(),
            rounds: state.rounds.len(),
        });
        self.events.close();
        self.state.send_replace(stop.outcome.final_state());

        RunResult {
            run_id: self.run_id.clone(),
            task: state.task,
            outcome: stop.outcome,
            reason: stop.reason,
            answer: stop.answer,
            failure: stop.failure,
            plan: state.plan,
            rounds: state.rounds,
            metrics: state.metrics,
            started_at: state.started_at,
            finished_at: Utc::now(),
        }
    }
}

fn awaiting_event(interaction_id: String, payload: InteractionPayload) -> EventPayload {
    match payload {
        InteractionPayload::Plan { plan } => EventPayload::HitlAwaitingPlanApproval {
            interaction_id,
            plan,
        },
        InteractionPayload::Code { code } => EventPayload::HitlAwaitingCodeApproval {
            interaction_id,
            code,
        },
        InteractionPayload::Error { code, error } => EventPayload::HitlAwaitingErrorGuidance {
            interaction_id,
            code,
            error,
        },
        InteractionPayload::Answer { answer } => EventPayload::HitlAwaitingAnswerApproval {
            interaction_id,
            answer,
        },
    }
}

#[derive(Default)]
pub struct EngineBuilder {
    llm: Option<Arc<dyn LanguageModel>>,
    environment: Option<Box<dyn ExecutionEnvironment>>,
    tools: Option<Arc<ToolManager>>,
    config: EngineConfig,
    context: Option<Arc<RunContext>>,
    run_id: Option<String>,
    cancel: Option<CancellationToken>,
}

impl EngineBuilder {
    pub fn llm(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn environment(mut self, environment: impl ExecutionEnvironment + 'static) -> Self {
        self.environment = Some(Box::new(environment));
        self
    }

    pub fn boxed_environment(mut self, environment: Box<dyn ExecutionEnvironment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn tools(mut self, tools: Arc<ToolManager>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hitl_mode(mut self, mode: HitlMode) -> Self {
        self.config.hitl_mode = mode;
        self
    }

    pub fn max_rounds(mut self, max_rounds: u32) -> Self {
        self.config.max_rounds = max_rounds;
        self
    }

    /// Run directories. Events are journaled to the context's events log.
    pub fn context(mut self, context: Arc<RunContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Share a cancellation token with the caller, e.g. to tie the run to a
    /// signal handler.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> crate::Result<Engine> {
        let llm = self
            .llm
            .ok_or_else(|| ConfigError::NotFound { key: "llm".into() })?;
        let environment = self.environment.ok_or_else(|| ConfigError::NotFound {
            key: "environment".into(),
        })?;
        if self.config.max_rounds == 0 {
            return Err(ConfigError::invalid("max_rounds", "must be at least 1").into());
        }

        let run_id = self
            .run_id
            .or_else(|| self.context.as_ref().map(|c| c.run_id.clone()))
            .unwrap_or_else(generate_run_id);
        let (state, _) = watch::channel(EngineState::Starting);

        Ok(Engine {
            run_id,
            llm,
            environment: Mutex::new(environment),
            tools: self.tools,
            gateway: Arc::new(HitlGateway::new(self.config.hitl_mode)),
            config: self.config,
            context: self.context,
            events: Arc::new(EventLog::new()),
            cancel: self.cancel.unwrap_or_default(),
            state,
        })
    }
}
