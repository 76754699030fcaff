//! Append-only event log with independent subscriber cursors.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::stream::{self, Stream};
use tokio::sync::watch;

use super::{AgentEvent, EventPayload};

/// Ordered stream of events, always starting from the first one.
pub type EventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

#[derive(Default)]
struct LogState {
    events: Vec<AgentEvent>,
    closed: bool,
}

pub struct EventLog {
    state: Mutex<LogState>,
    notify: watch::Sender<u64>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("EventLog")
            .field("len", &state.events.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            state: Mutex::new(LogState::default()),
            notify,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event. The sequence number is assigned under the same lock as
    /// the append, so numbering never has gaps or reorderings.
    pub fn publish(&self, payload: EventPayload) -> AgentEvent {
        let event = {
            let mut state = self.lock();
            let event = AgentEvent {
                seq: state.events.len() as u64 + 1,
                timestamp: Utc::now(),
                payload,
            };
            state.events.push(event.clone());
            event
        };

        tracing::trace!(seq = event.seq, kind = event.kind(), "event published");
        self.notify.send_replace(event.seq);
        event
    }

    /// Mark the log finished. Subscribers end once they have drained it.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.send_modify(|_| {});
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<AgentEvent> {
        self.lock().events.get(index).cloned()
    }

    pub fn snapshot(&self) -> Vec<AgentEvent> {
        self.lock().events.clone()
    }

    /// Attach a new consumer reading from the first event.
    pub fn subscribe(self: &Arc<Self>) -> EventStream {
        let rx = self.notify.subscribe();
        let state = (Arc::clone(self), 0usize, rx);

        Box::pin(stream::unfold(state, |(log, cursor, mut rx)| async move {
            loop {
                let (next, closed) = {
                    let state = log.lock();
                    (state.events.get(cursor).cloned(), state.closed)
                };
                if let Some(event) = next {
                    return Some((event, (log, cursor + 1, rx)));
                }
                if closed || rx.changed().await.is_err() {
                    return None;
                }
            }
        }))
    }
}
