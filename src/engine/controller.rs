//! External control surface of a running engine.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{EngineState, RunResult};
use crate::events::{AgentEvent, EventLog, EventStream};
use crate::hitl::{HitlError, HitlGateway, HitlState, PendingInteraction};

/// Cloneable handle for answering checkpoints, cancelling the run, and
/// observing its events. Safe to use from any task while the engine runs.
#[derive(Debug, Clone)]
pub struct RunController {
    run_id: String,
    gateway: Arc<HitlGateway>,
    events: Arc<EventLog>,
    cancel: CancellationToken,
    state: watch::Receiver<EngineState>,
}

impl RunController {
    pub(crate) fn new(
        run_id: String,
        gateway: Arc<HitlGateway>,
        events: Arc<EventLog>,
        cancel: CancellationToken,
        state: watch::Receiver<EngineState>,
    ) -> Self {
        Self {
            run_id,
            gateway,
            events,
            cancel,
            state,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn approve(&self, note: Option<String>) -> Result<(), HitlError> {
        self.gateway.approve(note)
    }

    pub fn reject(&self, reason: impl Into<String>) -> Result<(), HitlError> {
        self.gateway.reject(reason)
    }

    /// Replace the plan under review with `text` in checklist form.
    pub fn modify_plan(&self, text: &str) -> Result<(), HitlError> {
        self.gateway.modify_plan(text)
    }

    pub fn modify_code(&self, code: impl Into<String>) -> Result<(), HitlError> {
        self.gateway.modify_code(code)
    }

    pub fn skip(&self) -> Result<(), HitlError> {
        self.gateway.skip()
    }

    pub fn send_feedback(&self, text: impl Into<String>) -> Result<(), HitlError> {
        self.gateway.send_feedback(text)
    }

    /// End the run as rejected, whether or not a checkpoint is open.
    pub fn abort(&self, reason: impl Into<String>) {
        self.gateway.abort(reason);
    }

    /// Stop the run at the next suspension point. The outcome is `aborted`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn hitl_state(&self) -> HitlState {
        self.gateway.state()
    }

    pub fn pending(&self) -> Option<PendingInteraction> {
        self.gateway.pending()
    }

    /// Events from the first one on, ending after `run_finished`.
    pub fn events(&self) -> EventStream {
        self.events.subscribe()
    }

    pub fn event_history(&self) -> Vec<AgentEvent> {
        self.events.snapshot()
    }

    /// Resolves once the engine reaches a terminal state.
    pub async fn wait_finished(&self) -> EngineState {
        let mut state = self.state.clone();
        let settled = state.wait_for(EngineState::is_terminal).await.map(|s| *s);
        settled.unwrap_or_else(|_| *state.borrow())
    }
}

/// A run executing on its own task.
#[derive(Debug)]
pub struct RunHandle {
    pub controller: RunController,
    pub join: JoinHandle<RunResult>,
}

impl RunHandle {
    pub async fn wait(self) -> Result<RunResult, tokio::task::JoinError> {
        self.join.await
    }
}
