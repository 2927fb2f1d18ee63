//! SolverService - wires the components together
//!
//! One service per process. It owns the state manager handle, the progress bus,
//! the scheduler and the worker context, and exposes the operations callers
//! (the CLI, an HTTP layer) need: submit, prepare, cancel, subscribe, polling
//! views and the capacity signal.

use std::sync::Arc;

use futures::{Stream, stream};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::capacity::CapacitySignal;
use crate::config::Config;
use crate::domain::{LogRecord, Principal, ProgressRecord, Task, TaskStatus, TransitionOutcome};
use crate::engine::{CancelReason, parse_system};
use crate::events::{ProgressBus, PushMessage, TaskEvent};
use crate::scheduler::{Scheduler, SchedulerSignal, admission};
use crate::state::{AdmissionCaps, ProgressAck, StateError, StateManager, TaskPatch};
use crate::worker::{CancelRegistry, WorkerContext, run_task};

/// Errors surfaced to callers of the service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Not authorized to access task {0}")]
    NotAuthorized(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl ServiceError {
    /// Close code for a push channel refused with this error
    pub fn close_code(&self) -> u16 {
        match self {
            Self::NotAuthenticated => 4001,
            Self::NotAuthorized(_) => 4003,
            Self::TaskNotFound(_) => 4004,
            Self::State(_) => 1011,
        }
    }
}

/// Subscription refusals share the service error type
pub type SubscribeError = ServiceError;

/// Options for a new task
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub save_factors: bool,
    /// Lower the configured size limit for this task
    pub max_n: Option<usize>,
}

/// What a submitter learns right away
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub id: String,
    pub status: TaskStatus,
    pub queue_position: Option<usize>,
    pub estimated_wait_secs: Option<u64>,
}

/// Task detail with queue information
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub queue_position: Option<usize>,
    pub estimated_wait_secs: Option<u64>,
    pub latest_progress: Option<ProgressRecord>,
}

/// Live view of one task
///
/// Yields [`PushMessage::InitialState`] first, then updates. Dropping the
/// subscription releases its bus channel.
pub struct Subscription {
    task_id: String,
    initial: Option<PushMessage>,
    rx: Option<broadcast::Receiver<TaskEvent>>,
    bus: Arc<ProgressBus>,
}

impl Subscription {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next message; `None` once the bus side is gone
    pub async fn next(&mut self) -> Option<PushMessage> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(PushMessage::Update(event)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(task_id = %self.task_id, missed, "Subscription::next: lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Subscription {
    /// Adapt into a stream for transports that consume `Stream`s
    pub fn into_stream(self) -> impl Stream<Item = PushMessage> + Send {
        stream::unfold(self, |mut subscription| async move {
            let message = subscription.next().await?;
            Some((message, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.rx.take());
        self.bus.unsubscribe(&self.task_id);
    }
}

/// State behind [`SolverService::follow`]
struct Follow<'a> {
    service: &'a SolverService,
    subscription: Subscription,
    poll: tokio::time::Interval,
    bus_open: bool,
    last: Option<(TaskStatus, f64)>,
    done: bool,
}

impl Follow<'_> {
    async fn next(&mut self) -> Option<PushMessage> {
        if self.done {
            return None;
        }
        let message = loop {
            tokio::select! {
                message = self.subscription.next(), if self.bus_open => match message {
                    Some(message) => break message,
                    None => self.bus_open = false,
                },
                _ = self.poll.tick() => match self.poll_store().await {
                    Ok(Some(message)) => break message,
                    Ok(None) => {}
                    Err(e) => warn!(task_id = %self.subscription.task_id(), error = %e, "Failed to poll task"),
                },
            }
        };

        let event = message.event();
        self.last = Some((event.status, event.percentage));
        self.done = event.status.is_terminal();
        Some(message)
    }

    /// Synthesize an update when the stored task moved since the last message
    async fn poll_store(&self) -> Result<Option<PushMessage>, ServiceError> {
        let task_id = self.subscription.task_id();
        let state = &self.service.state;
        let task = state.get_task_required(task_id).await?;
        let latest = state.latest_progress(task_id).await?;
        let mut event = TaskEvent::snapshot(&task, latest.as_ref());
        if self.last == Some((event.status, event.percentage)) {
            return Ok(None);
        }
        let (position, wait) = self.service.queue_info(task_id).await?;
        event = event.with_queue(position, wait);
        debug!(%task_id, status = %event.status, pct = event.percentage, "poll_store: task moved");
        Ok(Some(PushMessage::Update(event)))
    }
}

fn round_secs(wait: Option<f64>) -> Option<u64> {
    wait.map(|w| w.max(0.0).round() as u64)
}

pub struct SolverService {
    config: Config,
    state: StateManager,
    bus: Arc<ProgressBus>,
    scheduler: Arc<Scheduler>,
    worker: WorkerContext,
    signals: Mutex<Option<mpsc::UnboundedReceiver<SchedulerSignal>>>,
}

impl SolverService {
    /// Open the store under the configured data dir and spawn the state actor
    ///
    /// Must be called inside a tokio runtime.
    pub fn open(config: Config) -> eyre::Result<Self> {
        debug!(data_dir = %config.storage.data_dir.display(), "SolverService::open: called");
        config.validate()?;

        let bus = Arc::new(ProgressBus::new(config.worker.bus_capacity));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let state = StateManager::spawn(config.storage.store_path(), bus.clone(), signal_tx)?;
        let scheduler = Arc::new(Scheduler::new(
            state.clone(),
            config.admission.global_cap,
            config.scheduler.clone(),
        ));
        let worker = WorkerContext {
            state: state.clone(),
            bus: bus.clone(),
            artifacts: ArtifactStore::new(config.storage.artifacts_dir()),
            cancels: CancelRegistry::new(),
            limits: config.limits.clone(),
            progress_log_step: config.worker.progress_log_step,
        };

        Ok(Self {
            config,
            state,
            bus,
            scheduler,
            worker,
            signals: Mutex::new(Some(signal_rx)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn caps(&self) -> AdmissionCaps {
        AdmissionCaps {
            global: self.config.admission.global_cap,
            per_user: self.config.admission.per_user_cap,
        }
    }

    async fn authorized_task(&self, principal: &Principal, task_id: &str) -> Result<Task, ServiceError> {
        let task = self
            .state
            .get_task(task_id)
            .await?
            .ok_or_else(|| ServiceError::TaskNotFound(task_id.to_string()))?;
        if !principal.can_access(&task) {
            debug!(%task_id, user = %principal.user_id, "authorized_task: denied");
            return Err(ServiceError::NotAuthorized(task_id.to_string()));
        }
        Ok(task)
    }

    /// Store a checkpoint and push it to subscribers
    async fn record_progress(&self, task: &Task, stage: &str, pct: f64) {
        match self
            .state
            .append_progress(ProgressRecord::new(&task.id, stage, pct))
            .await
        {
            Ok(ProgressAck::Recorded) => {
                self.bus.publish(TaskEvent::from_task(task, stage, pct));
            }
            Ok(ProgressAck::Terminal(status)) => {
                debug!(task_id = %task.id, %status, "record_progress: task already finished");
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "Failed to record progress"),
        }
    }

    async fn record_log(&self, record: LogRecord) {
        if let Err(e) = self.state.append_log(record).await {
            warn!(error = %e, "Failed to write task log");
        }
    }

    /// Queue position and wait estimate in seconds for a task
    async fn queue_info(&self, task_id: &str) -> Result<(Option<usize>, Option<f64>), ServiceError> {
        let Some(position) = self.state.queue_position(task_id).await? else {
            return Ok((None, None));
        };
        let avg = self
            .state
            .average_duration_secs()
            .await?
            .unwrap_or(self.config.admission.fallback_avg_secs);
        let wait = admission::estimate_wait_secs(position, avg, self.config.admission.global_cap);
        Ok((Some(position), Some(wait)))
    }

    /// Admit a new task for `principal`
    pub async fn submit(&self, principal: &Principal, request: SubmitRequest) -> Result<SubmitReceipt, ServiceError> {
        debug!(user = %principal.user_id, ?request, "submit: called");
        let max_n = request
            .max_n
            .map_or(self.config.limits.max_n, |n| n.min(self.config.limits.max_n));
        let task = Task::new(&principal.user_id, max_n)
            .with_name(request.name)
            .with_description(request.description)
            .with_save_factors(request.save_factors);

        let task = self.state.admit_task(task, self.caps()).await?;
        self.record_progress(&task, "Awaiting parse", 1.0).await;

        let (queue_position, wait) = self.queue_info(&task.id).await?;
        info!(task_id = %task.id, status = %task.status, ?queue_position, "Task submitted");
        Ok(SubmitReceipt {
            id: task.id,
            status: task.status,
            queue_position,
            estimated_wait_secs: round_secs(wait),
        })
    }

    /// Validate raw input text and queue the task
    ///
    /// Invalid input fails the task; the outcome reports what happened.
    pub async fn prepare(&self, task_id: &str, raw_text: &str) -> Result<TransitionOutcome, ServiceError> {
        debug!(%task_id, len = raw_text.len(), "prepare: called");
        let task = self.state.get_task_required(task_id).await?;
        if task.status.is_terminal() {
            return Ok(TransitionOutcome::AlreadyTerminal(task.status));
        }

        self.record_progress(&task, "Parsing input", 5.0).await;

        let system = match parse_system(raw_text, task.max_n) {
            Ok(system) => system,
            Err(e) => {
                info!(%task_id, error = %e, "Input rejected");
                self.record_log(LogRecord::error(task_id, format!("Input rejected: {}", e)))
                    .await;
                let patch = TaskPatch::message(format!("Invalid input: {}", e));
                return Ok(self.state.transition(task_id, TaskStatus::Failed, patch).await?);
            }
        };

        let path = match self.worker.artifacts.write_input(task_id, &system) {
            Ok(path) => path,
            Err(e) => {
                error!(%task_id, error = %format!("{:#}", e), "Failed to store input");
                self.record_log(LogRecord::error(task_id, format!("Failed to store input: {:#}", e)))
                    .await;
                let patch = TaskPatch::message("Failed to store input");
                return Ok(self.state.transition(task_id, TaskStatus::Failed, patch).await?);
            }
        };

        // Both must land before the status change: once Queued, a worker may
        // start recording its own checkpoints and logs. The Queued event
        // carries the checkpoint.
        let n = system.n();
        self.record_log(LogRecord::info(task_id, format!("Input validated: {}x{} system", n, n)))
            .await;
        if let Err(e) = self
            .state
            .append_progress(ProgressRecord::new(task_id, "Queued for computation", 10.0))
            .await
        {
            warn!(%task_id, error = %e, "Failed to record progress");
        }

        Ok(self
            .state
            .mark_validated(task_id, path.to_string_lossy().into_owned(), n)
            .await?)
    }

    /// Cancel a non-terminal task (owner or staff)
    pub async fn cancel(&self, principal: &Principal, task_id: &str) -> Result<TransitionOutcome, ServiceError> {
        debug!(%task_id, user = %principal.user_id, "cancel: called");
        let task = self.authorized_task(principal, task_id).await?;
        if task.status.is_terminal() {
            return Ok(TransitionOutcome::AlreadyTerminal(task.status));
        }

        let patch = TaskPatch::message(format!("Cancelled by {}", principal.user_id));
        let outcome = self.state.transition(task_id, TaskStatus::Cancelled, patch).await?;
        if outcome.is_applied() {
            if self.worker.cancels.cancel(task_id, CancelReason::Requested) {
                debug!(%task_id, "cancel: tripped running job");
            }
            self.record_log(LogRecord::warn(
                task_id,
                format!("Cancelled by {}", principal.user_id),
            ))
            .await;
            info!(%task_id, user = %principal.user_id, "Task cancelled");
        }
        Ok(outcome)
    }

    /// Attach to a task's live updates
    pub async fn subscribe(
        &self,
        principal: Option<&Principal>,
        task_id: &str,
    ) -> Result<Subscription, SubscribeError> {
        debug!(%task_id, "subscribe: called");
        let principal = principal.ok_or(ServiceError::NotAuthenticated)?;
        self.authorized_task(principal, task_id).await?;

        // Subscribe before reading the snapshot so nothing falls in between
        let rx = self.bus.subscribe(task_id);
        let mut subscription = Subscription {
            task_id: task_id.to_string(),
            initial: None,
            rx: Some(rx),
            bus: self.bus.clone(),
        };

        let task = self.state.get_task_required(task_id).await?;
        let latest = self.state.latest_progress(task_id).await?;
        let (position, wait) = self.queue_info(task_id).await?;
        let initial = TaskEvent::snapshot(&task, latest.as_ref()).with_queue(position, wait);
        subscription.initial = Some(PushMessage::InitialState(initial));
        Ok(subscription)
    }

    /// Follow a task until it reaches a terminal status
    ///
    /// Starts with the subscription's initial state. Bus updates only come from
    /// work done in this process, so the store is also polled every scheduler
    /// poll interval to pick up changes written by workers elsewhere. The
    /// stream ends after the first terminal message.
    pub async fn follow(
        &self,
        principal: &Principal,
        task_id: &str,
    ) -> Result<impl Stream<Item = PushMessage> + '_, ServiceError> {
        debug!(%task_id, "follow: called");
        let subscription = self.subscribe(Some(principal), task_id).await?;
        let mut poll = tokio::time::interval(self.config.scheduler.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let follow = Follow {
            service: self,
            subscription,
            poll,
            bus_open: true,
            last: None,
            done: false,
        };
        Ok(stream::unfold(follow, |mut follow| async move {
            let message = follow.next().await?;
            Some((message, follow))
        }))
    }

    /// Progress checkpoints, oldest first
    pub async fn progress(&self, principal: &Principal, task_id: &str) -> Result<Vec<ProgressRecord>, ServiceError> {
        self.authorized_task(principal, task_id).await?;
        Ok(self.state.list_progress(task_id).await?)
    }

    /// Log lines, oldest first
    pub async fn logs(&self, principal: &Principal, task_id: &str) -> Result<Vec<LogRecord>, ServiceError> {
        self.authorized_task(principal, task_id).await?;
        Ok(self.state.list_logs(task_id).await?)
    }

    /// Task with queue position, wait estimate and latest progress
    pub async fn detail(&self, principal: &Principal, task_id: &str) -> Result<TaskView, ServiceError> {
        let task = self.authorized_task(principal, task_id).await?;
        let (queue_position, wait) = self.queue_info(task_id).await?;
        let latest_progress = self.state.latest_progress(task_id).await?;
        Ok(TaskView {
            task,
            queue_position,
            estimated_wait_secs: round_secs(wait),
            latest_progress,
        })
    }

    /// Tasks visible to `principal`: all for staff, own otherwise
    pub async fn list(&self, principal: &Principal, status: Option<TaskStatus>) -> Result<Vec<Task>, ServiceError> {
        let owner = (!principal.is_staff).then(|| principal.user_id.clone());
        Ok(self.state.list_tasks(status, owner).await?)
    }

    /// Load figures for a replica controller
    pub async fn capacity(&self) -> Result<CapacitySignal, ServiceError> {
        let counts = self.state.counts().await?;
        Ok(CapacitySignal::from_counts(&counts, &self.config.autoscale))
    }

    /// Run the scheduler and workers until `shutdown` flips to true
    ///
    /// In-flight jobs are allowed to finish before this returns.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> eyre::Result<()> {
        let signals = self
            .signals
            .lock()
            .await
            .take()
            .ok_or_else(|| eyre::eyre!("SolverService::run called twice"))?;
        info!(global_cap = self.config.admission.global_cap, "Solver service running");

        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel();
        let scheduler = tokio::spawn(self.scheduler.clone().run(signals, dispatch_tx, shutdown.clone()));

        let mut jobs = JoinSet::new();
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                task = dispatch_rx.recv() => {
                    let Some(task) = task else { break };
                    debug!(task_id = %task.id, "run: spawning worker");
                    jobs.spawn(run_task(self.worker.clone(), task));
                }
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Worker task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = jobs.len(), "Solver service stopping, waiting for running jobs");
        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }
        if let Err(e) = scheduler.await {
            error!(error = %e, "Scheduler task failed");
        }
        info!("Solver service stopped");
        Ok(())
    }
}
