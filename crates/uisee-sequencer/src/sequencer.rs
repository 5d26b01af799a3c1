//! Step sequencer: runs a step list strictly in order.
//!
//! Per step: sleep the pre-wait, dispatch, sleep the post-wait. Every
//! dispatch failure becomes a step result; nothing short of cancellation
//! stops a run early.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::Local;
use futures::FutureExt;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use uisee_core::{
    CommandError, EventStore, Routed, RunEvent, RunId, RunLog, RunLogBuilder, RunState,
    RunStorage, Step, StepAction, StepResult, StepStatus, StoredRun, TargetCommand,
    TransportKind,
};
use uisee_executor::CommandAdapter;
use uuid::Uuid;

/// Sequencer error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SequencerError {
    #[error("Run already in progress")]
    AlreadyRunning,
}

/// Repeat count and pad behaviour for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Number of passes over the list, at least 1.
    pub repeat: usize,
    /// Skip every post-wait pad.
    pub skip_post_wait: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            repeat: 1,
            skip_post_wait: false,
        }
    }
}

impl RunOptions {
    /// Options with `repeat` normalized: zero or negative becomes 1.
    #[must_use]
    pub fn new(repeat: i64, skip_post_wait: bool) -> Self {
        Self {
            repeat: usize::try_from(repeat).ok().filter(|&n| n >= 1).unwrap_or(1),
            skip_post_wait,
        }
    }

    /// Options with the repeat count taken from user text; anything that is
    /// not a positive integer becomes 1.
    #[must_use]
    pub fn from_text(repeat: &str, skip_post_wait: bool) -> Self {
        Self::new(repeat.trim().parse().unwrap_or(1), skip_post_wait)
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: RunId,
    pub state: RunState,
    pub log: RunLog,
}

/// What a dispatch produced, before timing is attached.
struct Outcome {
    status: StepStatus,
    via: Option<TransportKind>,
    output: String,
    cancelled: bool,
}

impl Outcome {
    fn cancelled(via: Option<TransportKind>) -> Self {
        Self {
            status: StepStatus::Error,
            via,
            output: CommandError::Cancelled.to_string(),
            cancelled: true,
        }
    }

    fn routed(routed: Routed) -> Self {
        Self {
            status: StepStatus::from_routed(&routed.result),
            via: Some(routed.via),
            output: routed.output_text(),
            cancelled: routed.result == Err(CommandError::Cancelled),
        }
    }
}

/// Leaves the run state `Aborted` if a run is dropped mid-flight.
struct RunGuard<'a> {
    state: &'a watch::Sender<RunState>,
    finished: bool,
}

impl RunGuard<'_> {
    fn finish(mut self, state: RunState) {
        self.state.send_replace(state);
        self.finished = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state.send_replace(RunState::Aborted);
        }
    }
}

/// Runs step lists through a [`CommandAdapter`], one run at a time.
pub struct StepSequencer {
    adapter: Arc<CommandAdapter>,
    events: Arc<EventStore>,
    storage: Option<Arc<dyn RunStorage>>,
    state: watch::Sender<RunState>,
}

impl StepSequencer {
    #[must_use]
    pub fn new(adapter: Arc<CommandAdapter>) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            adapter,
            events: Arc::new(EventStore::new()),
            storage: None,
            state,
        }
    }

    /// Keep every finished run in `storage`.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn RunStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Progress events of the current or last run.
    #[must_use]
    pub fn events(&self) -> Arc<EventStore> {
        Arc::clone(&self.events)
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Execute `steps` `options.repeat` times.
    ///
    /// The log holds one result per step per repeat, in authored order. If
    /// `cancel` fires the current step is recorded and the run ends `Aborted`.
    ///
    /// # Errors
    /// Returns `AlreadyRunning` if another run is in progress.
    pub async fn run(
        &self,
        steps: &[Step],
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunReport, SequencerError> {
        let guard = self.begin()?;
        let run_id = Uuid::new_v4();
        let repeat = options.repeat.max(1);

        self.events.clear();
        self.events.push(RunEvent::RunStarted {
            run_id,
            steps: steps.len(),
            repeat,
        });
        tracing::info!(%run_id, steps = steps.len(), repeat, "Run started");

        let mut log = RunLogBuilder::new();
        let mut aborted = false;
        'repeats: for pass in 1..=repeat {
            for (index, step) in steps.iter().enumerate() {
                if cancel.is_cancelled() {
                    aborted = true;
                    break 'repeats;
                }
                let (result, cancelled) = self
                    .run_step(run_id, index, pass, step, options, cancel)
                    .await;
                self.events.push(RunEvent::StepFinished {
                    run_id,
                    result: result.clone(),
                });
                log.push(result);
                if cancelled {
                    aborted = true;
                    break 'repeats;
                }
            }
        }

        let state = if aborted {
            RunState::Aborted
        } else {
            RunState::Completed
        };
        let log = log.finish();
        if aborted {
            tracing::warn!(%run_id, results = log.len(), "Run aborted");
        } else {
            tracing::info!(
                %run_id,
                results = log.len(),
                failed = log.len() - log.count(StepStatus::Success) - log.count(StepStatus::Waited),
                "Run completed"
            );
        }

        if let Some(storage) = &self.storage {
            let stored = StoredRun {
                id: run_id,
                state,
                finished_at: Local::now(),
                log: log.clone(),
            };
            if let Err(e) = storage.save(stored).await {
                tracing::warn!(%run_id, "Failed to store run: {e}");
            }
        }

        self.events.push(RunEvent::RunFinished {
            run_id,
            state,
            results: log.len(),
        });
        guard.finish(state);
        Ok(RunReport { run_id, state, log })
    }

    fn begin(&self) -> Result<RunGuard<'_>, SequencerError> {
        let mut started = false;
        self.state.send_if_modified(|state| {
            if *state == RunState::Running {
                false
            } else {
                *state = RunState::Running;
                started = true;
                true
            }
        });
        if started {
            Ok(RunGuard {
                state: &self.state,
                finished: false,
            })
        } else {
            Err(SequencerError::AlreadyRunning)
        }
    }

    async fn run_step(
        &self,
        run_id: RunId,
        index: usize,
        pass: usize,
        step: &Step,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> (StepResult, bool) {
        let command = step.display_text();
        self.events.push(RunEvent::StepStarted {
            run_id,
            step: index,
            repeat: pass,
            kind: step.kind(),
            command: command.clone(),
        });
        tracing::debug!(step = index, repeat = pass, kind = step.kind().as_str(), command = %command, "Step started");

        let start = Local::now();
        let started = Instant::now();

        let mut outcome = if sleep_or_cancel(step.pre_wait(), cancel).await {
            AssertUnwindSafe(self.dispatch(step, cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Outcome {
                    status: StepStatus::Error,
                    via: None,
                    output: panic_message(panic.as_ref()),
                    cancelled: false,
                })
        } else {
            Outcome::cancelled(None)
        };

        if !outcome.cancelled
            && !options.skip_post_wait
            && !sleep_or_cancel(step.post_wait(), cancel).await
        {
            outcome.cancelled = true;
        }

        let result = StepResult {
            step: index,
            repeat: pass,
            kind: step.kind(),
            command,
            via: outcome.via,
            start,
            end: Local::now(),
            duration_sec: started.elapsed().as_secs_f64(),
            status: outcome.status,
            output: outcome.output,
        };
        match result.status {
            StepStatus::Success | StepStatus::Waited => {
                tracing::info!(step = index, repeat = pass, status = ?result.status, "Step finished");
            }
            _ => tracing::warn!(
                step = index,
                repeat = pass,
                status = ?result.status,
                output = %result.output,
                "Step failed"
            ),
        }
        (result, outcome.cancelled)
    }

    async fn dispatch(&self, step: &Step, cancel: &CancellationToken) -> Outcome {
        match &step.action {
            StepAction::Wait { seconds } => match Duration::try_from_secs_f64(*seconds) {
                Ok(duration) => {
                    if sleep_or_cancel(duration, cancel).await {
                        Outcome {
                            status: StepStatus::Waited,
                            via: None,
                            output: format!("Waited {seconds}s"),
                            cancelled: false,
                        }
                    } else {
                        Outcome::cancelled(None)
                    }
                }
                Err(e) => Outcome {
                    status: StepStatus::Invalid,
                    via: None,
                    output: format!("Invalid wait of {seconds}s: {e}"),
                    cancelled: false,
                },
            },
            StepAction::PublishAndWait { command } => match TargetCommand::parse(command) {
                Ok(target) => Outcome::routed(self.adapter.send_command(&target, Some(cancel)).await),
                Err(e) => Outcome {
                    status: StepStatus::Invalid,
                    via: None,
                    output: e.to_string(),
                    cancelled: false,
                },
            },
            StepAction::RemoteExec { command } => {
                Outcome::routed(self.adapter.exec(command, Some(cancel)).await)
            }
        }
    }
}

/// Sleep for `duration`; `false` if `cancel` fired first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "step panicked".to_string())
}
