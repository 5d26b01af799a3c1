//! Run progress events with broadcast + history.

use std::{collections::VecDeque, sync::RwLock};

use futures::{StreamExt, future};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::result::StepResult;
use crate::step::StepKind;
use crate::traits::{RunId, RunState};

/// Events kept for late subscribers.
const HISTORY_LIMIT: usize = 10_000;

/// Progress of a run, emitted by the sequencer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        steps: usize,
        repeat: usize,
    },
    StepStarted {
        run_id: RunId,
        step: usize,
        repeat: usize,
        kind: StepKind,
        command: String,
    },
    StepFinished {
        run_id: RunId,
        result: StepResult,
    },
    RunFinished {
        run_id: RunId,
        state: RunState,
        results: usize,
    },
}

impl RunEvent {
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepFinished { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::RunFinished { .. })
    }
}

/// Event store with broadcast and history support.
///
/// Subscribers that attach mid-run get the history first, then live events.
pub struct EventStore {
    history: RwLock<VecDeque<RunEvent>>,
    sender: broadcast::Sender<RunEvent>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            history: RwLock::new(VecDeque::with_capacity(32)),
            sender,
        }
    }

    /// Push an event to both live listeners and history.
    pub fn push(&self, event: RunEvent) {
        let _ = self.sender.send(event.clone());

        match self.history.write() {
            Ok(mut history) => {
                if history.len() >= HISTORY_LIMIT {
                    history.pop_front();
                }
                history.push_back(event);
            }
            Err(e) => tracing::error!("Event history lock poisoned: {e}"),
        }
    }

    /// Drop all history, e.g. before a new run.
    pub fn clear(&self) {
        if let Ok(mut history) = self.history.write() {
            history.clear();
        }
    }

    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn get_history(&self) -> Vec<RunEvent> {
        self.history
            .read()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, RunEvent> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }

    /// Finished step results until the run ends.
    #[must_use]
    pub fn results_stream(&self) -> futures::stream::BoxStream<'static, StepResult> {
        self.history_plus_stream()
            .take_while(|event| future::ready(!event.is_finished()))
            .filter_map(|event| async move {
                match event {
                    RunEvent::StepFinished { result, .. } => Some(result),
                    _ => None,
                }
            })
            .boxed()
    }
}
