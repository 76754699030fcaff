//! Gateway state machine shared between the engine and human controllers.

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::mpsc;

use super::{
    Checkpoint, HitlError, HitlMode, HitlState, InteractionPayload, PendingInteraction,
    Resolution,
};
use crate::plan::Plan;

/// Messages delivered to the engine while it waits on a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewaySignal {
    Feedback(String),
    Resolved(Resolution),
}

/// The engine's side of an open checkpoint.
#[derive(Debug)]
pub struct CheckpointWait {
    pub interaction: PendingInteraction,
    signals: mpsc::UnboundedReceiver<GatewaySignal>,
}

impl CheckpointWait {
    /// Next feedback or the final resolution. `None` once the gateway is closed.
    pub async fn next(&mut self) -> Option<GatewaySignal> {
        self.signals.recv().await
    }
}

struct Slot {
    interaction: PendingInteraction,
    signals: mpsc::UnboundedSender<GatewaySignal>,
}

struct Inner {
    state: HitlState,
    pending: Option<Slot>,
    abort_reason: Option<String>,
}

pub struct HitlGateway {
    mode: HitlMode,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for HitlGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HitlGateway")
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}

impl HitlGateway {
    pub fn new(mode: HitlMode) -> Self {
        Self {
            mode,
            inner: Mutex::new(Inner {
                state: HitlState::Idle,
                pending: None,
                abort_reason: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> HitlMode {
        self.mode
    }

    pub fn state(&self) -> HitlState {
        self.lock().state
    }

    pub fn pending(&self) -> Option<PendingInteraction> {
        self.lock().pending.as_ref().map(|s| s.interaction.clone())
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().state == HitlState::Aborted
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.lock().abort_reason.clone()
    }

    /// Enter a checkpoint.
    ///
    /// Returns `Ok(None)` when the mode does not enable `checkpoint`; the
    /// gateway stays idle and the engine proceeds.
    pub fn open(
        &self,
        checkpoint: Checkpoint,
        payload: InteractionPayload,
    ) -> Result<Option<CheckpointWait>, HitlError> {
        let mut inner = self.lock();
        if inner.state == HitlState::Aborted {
            return Err(HitlError::Aborted(
                inner.abort_reason.clone().unwrap_or_default(),
            ));
        }
        if !self.mode.enables(checkpoint) {
            return Ok(None);
        }
        if inner.pending.is_some() {
            return Err(HitlError::AlreadyPending);
        }

        let interaction = PendingInteraction {
            id: uuid::Uuid::new_v4().to_string(),
            checkpoint,
            payload,
            created_at: Utc::now(),
            feedback: Vec::new(),
        };
        let (tx, rx) = mpsc::unbounded_channel();

        inner.state = checkpoint.awaiting_state();
        inner.pending = Some(Slot {
            interaction: interaction.clone(),
            signals: tx,
        });

        tracing::info!(
            interaction_id = %interaction.id,
            checkpoint = %checkpoint,
            "awaiting human input"
        );

        Ok(Some(CheckpointWait {
            interaction,
            signals: rx,
        }))
    }

    fn resolve(
        &self,
        action: &'static str,
        allowed: &[Checkpoint],
        resolution: impl FnOnce(&PendingInteraction) -> Result<Resolution, HitlError>,
    ) -> Result<(), HitlError> {
        let mut inner = self.lock();
        let slot = inner
            .pending
            .as_ref()
            .ok_or(HitlError::NoPendingInteraction)?;

        let checkpoint = slot.interaction.checkpoint;
        if !allowed.contains(&checkpoint) {
            return Err(HitlError::InvalidAction { action, checkpoint });
        }
        let resolution = resolution(&slot.interaction)?;

        let Some(slot) = inner.pending.take() else {
            return Err(HitlError::NoPendingInteraction);
        };
        if let Resolution::Rejected { reason } = &resolution {
            inner.abort_reason = Some(reason.clone());
            inner.state = HitlState::Aborted;
        } else {
            inner.state = HitlState::Idle;
        }

        tracing::info!(
            interaction_id = %slot.interaction.id,
            checkpoint = %checkpoint,
            action,
            "interaction resolved"
        );
        let _ = slot.signals.send(GatewaySignal::Resolved(resolution));
        Ok(())
    }

    pub fn approve(&self, note: Option<String>) -> Result<(), HitlError> {
        self.resolve("approve", ALL, |_| Ok(Resolution::Approved { note }))
    }

    /// Reject the pending interaction. The gateway becomes terminally aborted.
    pub fn reject(&self, reason: impl Into<String>) -> Result<(), HitlError> {
        let reason = reason.into();
        self.resolve("reject", ALL, |_| Ok(Resolution::Rejected { reason }))
    }

    /// Replace the plan under review. The pending interaction is left intact
    /// when `text` is not a valid plan.
    pub fn modify_plan(&self, text: &str) -> Result<(), HitlError> {
        self.resolve("modify_plan", &[Checkpoint::PlanApproval], |_| {
            Ok(Resolution::PlanModified(Plan::parse(text)?))
        })
    }

    pub fn modify_code(&self, code: impl Into<String>) -> Result<(), HitlError> {
        let code = code.into();
        self.resolve(
            "modify_code",
            &[Checkpoint::CodeApproval, Checkpoint::ErrorGuidance],
            |_| Ok(Resolution::CodeModified(code)),
        )
    }

    /// Bypass the code block under review without executing it.
    pub fn skip(&self) -> Result<(), HitlError> {
        self.resolve(
            "skip",
            &[Checkpoint::CodeApproval, Checkpoint::ErrorGuidance],
            |_| Ok(Resolution::Skipped),
        )
    }

    /// Attach feedback for the next model request without resolving.
    pub fn send_feedback(&self, text: impl Into<String>) -> Result<(), HitlError> {
        let text = text.into();
        let mut inner = self.lock();
        let slot = inner
            .pending
            .as_mut()
            .ok_or(HitlError::NoPendingInteraction)?;
        slot.interaction.feedback.push(text.clone());
        let _ = slot.signals.send(GatewaySignal::Feedback(text));
        Ok(())
    }

    /// Terminally abort, resolving any pending interaction as rejected.
    ///
    /// Unlike [`reject`](Self::reject) this works without a pending
    /// interaction, so callers can enforce their own deadlines.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.lock();
        if inner.state == HitlState::Aborted {
            return;
        }
        inner.state = HitlState::Aborted;
        inner.abort_reason = Some(reason.clone());
        if let Some(slot) = inner.pending.take() {
            let _ = slot
                .signals
                .send(GatewaySignal::Resolved(Resolution::Rejected { reason }));
        }
    }

    /// Drop any pending interaction without resolving it.
    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.pending = None;
        if inner.state.is_waiting() {
            inner.state = HitlState::Idle;
        }
    }
}

const ALL: &[Checkpoint] = &[
    Checkpoint::PlanApproval,
    Checkpoint::CodeApproval,
    Checkpoint::ErrorGuidance,
    Checkpoint::AnswerApproval,
];
