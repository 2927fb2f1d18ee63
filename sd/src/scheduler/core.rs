//! Queue scheduler
//!
//! Fills free running slots with the oldest dispatchable Queued tasks. Each
//! claim is one atomic state-manager command, so concurrent passes (in this
//! process or another one sharing the store) never exceed the global cap and
//! never dispatch the same task twice.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::domain::Task;
use crate::state::{StateManager, StateResponse};

use super::config::SchedulerConfig;

/// Reasons the scheduler should look for work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerSignal {
    /// A task's input was validated and it joined the queue
    Enqueued { task_id: String },
    /// A task reached a terminal status
    SlotFreed { task_id: String },
}

/// Counters for observability and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub passes: u64,
    pub dispatched: u64,
}

/// Dispatches queued tasks under the global running cap
pub struct Scheduler {
    state: StateManager,
    global_cap: usize,
    config: SchedulerConfig,
    stats: Mutex<SchedulerStats>,
}

impl Scheduler {
    pub fn new(state: StateManager, global_cap: usize, config: SchedulerConfig) -> Self {
        debug!(global_cap, ?config, "Scheduler::new: called");
        Self {
            state,
            global_cap: global_cap.max(1),
            config,
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    pub fn global_cap(&self) -> usize {
        self.global_cap
    }

    /// Claim until no slot or no eligible task is left
    ///
    /// Returns the tasks promoted to Running; the caller hands them to workers.
    /// Redundant calls are safe and return an empty list.
    pub async fn schedule_once(&self) -> StateResponse<Vec<Task>> {
        debug!("schedule_once: called");
        let mut claimed = Vec::new();
        while let Some(task) = self.state.claim_next_queued(self.global_cap).await? {
            debug!(task_id = %task.id, "schedule_once: claimed");
            claimed.push(task);
        }

        let mut stats = self.stats.lock().await;
        stats.passes += 1;
        stats.dispatched += claimed.len() as u64;
        if !claimed.is_empty() {
            info!(count = claimed.len(), "Dispatched queued tasks");
        }
        Ok(claimed)
    }

    pub async fn stats(&self) -> SchedulerStats {
        *self.stats.lock().await
    }

    /// Scheduler loop
    ///
    /// Runs a pass at startup, on every signal (bursts are coalesced), and on a
    /// poll interval. Claimed tasks are sent on `dispatch`. Returns when
    /// `shutdown` flips to true or every sender of `signals` is gone.
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<SchedulerSignal>,
        dispatch: mpsc::UnboundedSender<Task>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(global_cap = self.global_cap, "Scheduler started");
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        debug!("run: signal channel closed");
                        break;
                    };
                    debug!(?signal, "run: received signal");
                    // Coalesce a burst into one pass
                    while let Ok(extra) = signals.try_recv() {
                        debug!(?extra, "run: coalesced signal");
                    }
                }
                _ = poll.tick() => {
                    debug!("run: poll tick");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match self.schedule_once().await {
                Ok(tasks) => {
                    for task in tasks {
                        if dispatch.send(task).is_err() {
                            warn!("Dispatch channel closed, stopping scheduler");
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Scheduling pass failed"),
            }
        }

        info!("Scheduler stopped");
    }
}
