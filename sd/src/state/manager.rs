//! StateManager - actor that owns the TaskStore
//!
//! Processes commands via channels for thread-safe access to persistent state.
//! Every check-then-write operation runs inside one `IMMEDIATE` transaction, so
//! several processes sharing the store file cannot interleave inside it.
//!
//! Applied status changes are published on the progress bus. Applied
//! transitions into a terminal status send exactly one
//! [`SchedulerSignal::SlotFreed`].

use std::path::Path;
use std::sync::Arc;

use taskstore::{Tx, now_ms};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{Filter, LogRecord, ProgressRecord, Store, Task, TaskStatus, TransitionOutcome};
use crate::events::{ProgressBus, TaskEvent};
use crate::scheduler::{SchedulerSignal, admission};

use super::messages::{AdmissionCaps, ProgressAck, StateCommand, StateError, StateResponse, StatusCounts, TaskPatch};

/// Command buffer between handles and the actor
const COMMAND_BUFFER: usize = 256;

fn store_err(e: eyre::Report) -> StateError {
    StateError::StoreError(format!("{:#}", e))
}

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Open the store at `store_path` and spawn the actor
    pub fn spawn(
        store_path: impl AsRef<Path>,
        bus: Arc<ProgressBus>,
        signals: mpsc::UnboundedSender<SchedulerSignal>,
    ) -> eyre::Result<Self> {
        debug!(store_path = %store_path.as_ref().display(), "spawn: called");
        let mut store = Store::open(store_path.as_ref())?;

        let task_count = store.rebuild_indexes::<Task>()?;
        let progress_count = store.rebuild_indexes::<ProgressRecord>()?;
        let log_count = store.rebuild_indexes::<LogRecord>()?;
        info!(
            task_count,
            progress_count, log_count, "Rebuilt indexes for Task, ProgressRecord and LogRecord records"
        );

        Ok(Self::spawn_with_store(store, bus, signals))
    }

    /// Spawn the actor around an already opened store
    pub fn spawn_with_store(
        store: Store,
        bus: Arc<ProgressBus>,
        signals: mpsc::UnboundedSender<SchedulerSignal>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = Actor { store, bus, signals };
        tokio::spawn(actor_loop(actor, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Task operations ===

    /// Insert a task, choosing Pending or Queued from current load
    pub async fn admit_task(&self, task: Task, caps: AdmissionCaps) -> StateResponse<Task> {
        debug!(task_id = %task.id, owner = %task.owner, ?caps, "admit_task: called");
        self.request(|reply| StateCommand::AdmitTask { task, caps, reply })
            .await
    }

    /// Get a task by ID
    pub async fn get_task(&self, id: &str) -> StateResponse<Option<Task>> {
        debug!(%id, "get_task: called");
        self.request(|reply| StateCommand::GetTask {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Get a task by ID, returning error if not found
    pub async fn get_task_required(&self, id: &str) -> StateResponse<Task> {
        debug!(%id, "get_task_required: called");
        self.get_task(id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    /// List tasks with optional filters, in creation order
    pub async fn list_tasks(
        &self,
        status_filter: Option<TaskStatus>,
        owner_filter: Option<String>,
    ) -> StateResponse<Vec<Task>> {
        debug!(?status_filter, ?owner_filter, "list_tasks: called");
        self.request(|reply| StateCommand::ListTasks {
            status_filter,
            owner_filter,
            reply,
        })
        .await
    }

    /// Move a task along a lifecycle edge
    pub async fn transition(&self, id: &str, to: TaskStatus, patch: TaskPatch) -> StateResponse<TransitionOutcome> {
        debug!(%id, %to, "transition: called");
        self.request(|reply| StateCommand::Transition {
            id: id.to_string(),
            to,
            patch,
            reply,
        })
        .await
    }

    /// Record a validated input; Pending tasks move to Queued
    pub async fn mark_validated(
        &self,
        id: &str,
        input_artifact: String,
        matrix_size: usize,
    ) -> StateResponse<TransitionOutcome> {
        debug!(%id, matrix_size, "mark_validated: called");
        self.request(|reply| StateCommand::MarkValidated {
            id: id.to_string(),
            input_artifact,
            matrix_size,
            reply,
        })
        .await
    }

    // === Dispatch ===

    /// Promote the oldest dispatchable Queued task to Running if a slot is free
    pub async fn claim_next_queued(&self, global_cap: usize) -> StateResponse<Option<Task>> {
        debug!(global_cap, "claim_next_queued: called");
        self.request(|reply| StateCommand::ClaimNextQueued { global_cap, reply })
            .await
    }

    /// Bind a Running task to a worker job; false if already bound or not Running
    pub async fn claim_job(&self, id: &str, job_handle: &str) -> StateResponse<bool> {
        debug!(%id, %job_handle, "claim_job: called");
        self.request(|reply| StateCommand::ClaimJob {
            id: id.to_string(),
            job_handle: job_handle.to_string(),
            reply,
        })
        .await
    }

    // === Progress and logs ===

    /// Store a progress checkpoint unless the task already finished
    pub async fn append_progress(&self, record: ProgressRecord) -> StateResponse<ProgressAck> {
        debug!(task_id = %record.task_id, pct = record.percentage, "append_progress: called");
        self.request(|reply| StateCommand::AppendProgress { record, reply })
            .await
    }

    /// Store a log line
    pub async fn append_log(&self, record: LogRecord) -> StateResponse<()> {
        debug!(task_id = %record.task_id, level = %record.level, "append_log: called");
        self.request(|reply| StateCommand::AppendLog { record, reply })
            .await
    }

    /// Progress checkpoints of a task, oldest first
    pub async fn list_progress(&self, task_id: &str) -> StateResponse<Vec<ProgressRecord>> {
        debug!(%task_id, "list_progress: called");
        self.request(|reply| StateCommand::ListProgress {
            task_id: task_id.to_string(),
            reply,
        })
        .await
    }

    /// Latest progress checkpoint of a task
    pub async fn latest_progress(&self, task_id: &str) -> StateResponse<Option<ProgressRecord>> {
        Ok(self.list_progress(task_id).await?.pop())
    }

    /// Log lines of a task, oldest first
    pub async fn list_logs(&self, task_id: &str) -> StateResponse<Vec<LogRecord>> {
        debug!(%task_id, "list_logs: called");
        self.request(|reply| StateCommand::ListLogs {
            task_id: task_id.to_string(),
            reply,
        })
        .await
    }

    // === Queue metrics ===

    /// 1-based queue position for Pending/Queued tasks
    pub async fn queue_position(&self, id: &str) -> StateResponse<Option<usize>> {
        debug!(%id, "queue_position: called");
        self.request(|reply| StateCommand::QueuePosition {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Mean run time of completed tasks in seconds
    pub async fn average_duration_secs(&self) -> StateResponse<Option<f64>> {
        debug!("average_duration_secs: called");
        self.request(|reply| StateCommand::AverageDuration { reply }).await
    }

    /// Task counts per status
    pub async fn counts(&self) -> StateResponse<StatusCounts> {
        debug!("counts: called");
        self.request(|reply| StateCommand::Counts { reply }).await
    }

    /// Stop the actor after draining queued commands
    pub async fn shutdown(&self) -> StateResponse<()> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

struct Actor {
    store: Store,
    bus: Arc<ProgressBus>,
    signals: mpsc::UnboundedSender<SchedulerSignal>,
}

async fn actor_loop(mut actor: Actor, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("actor_loop: called");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::AdmitTask { task, caps, reply } => {
                debug!(task_id = %task.id, "actor_loop: AdmitTask command");
                let _ = reply.send(actor.admit(task, caps));
            }

            StateCommand::GetTask { id, reply } => {
                debug!(%id, "actor_loop: GetTask command");
                let _ = reply.send(actor.store.get(&id).map_err(store_err));
            }

            StateCommand::ListTasks {
                status_filter,
                owner_filter,
                reply,
            } => {
                debug!(?status_filter, ?owner_filter, "actor_loop: ListTasks command");
                let mut filters = Vec::new();
                if let Some(status) = status_filter {
                    filters.push(Filter::eq("status", status.as_str()));
                }
                if let Some(owner) = owner_filter {
                    filters.push(Filter::eq("owner", owner));
                }
                let _ = reply.send(actor.store.list(&filters).map_err(store_err));
            }

            StateCommand::Transition { id, to, patch, reply } => {
                debug!(%id, %to, "actor_loop: Transition command");
                let _ = reply.send(actor.transition(&id, to, patch));
            }

            StateCommand::MarkValidated {
                id,
                input_artifact,
                matrix_size,
                reply,
            } => {
                debug!(%id, matrix_size, "actor_loop: MarkValidated command");
                let _ = reply.send(actor.mark_validated(&id, input_artifact, matrix_size));
            }

            StateCommand::ClaimNextQueued { global_cap, reply } => {
                debug!(global_cap, "actor_loop: ClaimNextQueued command");
                let _ = reply.send(actor.claim_next_queued(global_cap));
            }

            StateCommand::ClaimJob { id, job_handle, reply } => {
                debug!(%id, %job_handle, "actor_loop: ClaimJob command");
                let _ = reply.send(actor.claim_job(&id, job_handle));
            }

            StateCommand::AppendProgress { record, reply } => {
                debug!(task_id = %record.task_id, "actor_loop: AppendProgress command");
                let _ = reply.send(actor.append_progress(record));
            }

            StateCommand::AppendLog { record, reply } => {
                debug!(task_id = %record.task_id, "actor_loop: AppendLog command");
                let result = actor.store.create(record).map(|_| ()).map_err(store_err);
                let _ = reply.send(result);
            }

            StateCommand::ListProgress { task_id, reply } => {
                debug!(%task_id, "actor_loop: ListProgress command");
                let _ = reply.send(actor.list_progress(&task_id).map_err(store_err));
            }

            StateCommand::ListLogs { task_id, reply } => {
                debug!(%task_id, "actor_loop: ListLogs command");
                let result = actor
                    .store
                    .list::<LogRecord>(&[Filter::eq("task_id", task_id)])
                    .map(|mut logs| {
                        logs.sort_by_key(|l| (l.timestamp, l.seq));
                        logs
                    })
                    .map_err(store_err);
                let _ = reply.send(result);
            }

            StateCommand::QueuePosition { id, reply } => {
                debug!(%id, "actor_loop: QueuePosition command");
                let _ = reply.send(actor.queue_position(&id));
            }

            StateCommand::AverageDuration { reply } => {
                debug!("actor_loop: AverageDuration command");
                let _ = reply.send(actor.average_duration_secs());
            }

            StateCommand::Counts { reply } => {
                debug!("actor_loop: Counts command");
                let _ = reply.send(actor.counts());
            }

            StateCommand::Shutdown => {
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}

/// Tasks in any of `statuses`, optionally for one owner
fn count_in(tx: &Tx<'_>, statuses: &[TaskStatus], owner: Option<&str>) -> eyre::Result<usize> {
    let mut total = 0;
    for status in statuses {
        let mut filters = vec![Filter::eq("status", status.as_str())];
        if let Some(owner) = owner {
            filters.push(Filter::eq("owner", owner));
        }
        total += tx.count::<Task>(&filters)?;
    }
    Ok(total)
}

impl Actor {
    fn admit(&mut self, mut task: Task, caps: AdmissionCaps) -> StateResponse<Task> {
        let task = self
            .store
            .transaction(|tx| {
                let user_active = count_in(tx, &TaskStatus::ACTIVE, Some(task.owner.as_str()))?;
                let global_active = count_in(tx, &TaskStatus::ACTIVE, None)?;
                task.status = admission::initial_status(user_active, global_active, caps);
                debug!(user_active, global_active, status = %task.status, "admit: decided");
                tx.create(task)
            })
            .map_err(store_err)?;

        info!(task_id = %task.id, owner = %task.owner, status = %task.status, "Task admitted");
        self.publish_status(&task);
        Ok(task)
    }

    fn transition(&mut self, id: &str, to: TaskStatus, patch: TaskPatch) -> StateResponse<TransitionOutcome> {
        let now = now_ms();
        let result = self
            .store
            .transaction(|tx| {
                let Some(mut task) = tx.get::<Task>(id)? else {
                    return Ok(None);
                };
                if task.status.is_terminal() {
                    debug!(%id, status = %task.status, "transition: already terminal");
                    return Ok(Some((TransitionOutcome::AlreadyTerminal(task.status), task)));
                }
                if !task.status.can_transition_to(to) {
                    debug!(%id, from = %task.status, %to, "transition: rejected edge");
                    return Ok(Some((TransitionOutcome::Rejected { from: task.status, to }, task)));
                }

                task.set_status(to, now);
                if let Some(message) = patch.result_message {
                    task.result_message = Some(message);
                }
                // Artifacts only ever accompany a successful result
                if to == TaskStatus::Completed {
                    task.result_artifact = patch.result_artifact;
                    task.factor_artifacts = patch.factor_artifacts;
                }
                tx.update(&task)?;
                Ok(Some((TransitionOutcome::Applied(to), task)))
            })
            .map_err(store_err)?;

        let (outcome, task) = result.ok_or_else(|| StateError::NotFound(id.to_string()))?;
        if outcome.is_applied() {
            info!(task_id = %task.id, status = %task.status, "Task status changed");
            self.publish_status(&task);
            if task.status.is_terminal() {
                self.signal(SchedulerSignal::SlotFreed { task_id: task.id.clone() });
            }
        }
        Ok(outcome)
    }

    fn mark_validated(
        &mut self,
        id: &str,
        input_artifact: String,
        matrix_size: usize,
    ) -> StateResponse<TransitionOutcome> {
        let now = now_ms();
        let result = self
            .store
            .transaction(|tx| {
                let Some(mut task) = tx.get::<Task>(id)? else {
                    return Ok(None);
                };
                match task.status {
                    status if status.is_terminal() => {
                        return Ok(Some((TransitionOutcome::AlreadyTerminal(status), task)));
                    }
                    TaskStatus::Running => {
                        return Ok(Some((
                            TransitionOutcome::Rejected {
                                from: TaskStatus::Running,
                                to: TaskStatus::Queued,
                            },
                            task,
                        )));
                    }
                    TaskStatus::Pending => task.set_status(TaskStatus::Queued, now),
                    _ => task.updated_at = now,
                }
                task.input_artifact = Some(input_artifact);
                task.matrix_size = Some(matrix_size);
                tx.update(&task)?;
                Ok(Some((TransitionOutcome::Applied(TaskStatus::Queued), task)))
            })
            .map_err(store_err)?;

        let (outcome, task) = result.ok_or_else(|| StateError::NotFound(id.to_string()))?;
        if outcome.is_applied() {
            info!(task_id = %task.id, matrix_size, "Task input validated and queued");
            self.publish_status(&task);
            self.signal(SchedulerSignal::Enqueued { task_id: task.id.clone() });
        }
        Ok(outcome)
    }

    fn claim_next_queued(&mut self, global_cap: usize) -> StateResponse<Option<Task>> {
        let now = now_ms();
        let claimed = self
            .store
            .transaction(|tx| {
                let running = tx.count::<Task>(&[Filter::eq("status", TaskStatus::Running.as_str())])?;
                if running >= global_cap {
                    debug!(running, global_cap, "claim_next_queued: no free slot");
                    return Ok(None);
                }

                let candidates: Vec<Task> = tx.list(&[
                    Filter::eq("status", TaskStatus::Queued.as_str()),
                    Filter::eq("has_input", true),
                ])?;
                let Some(mut task) = candidates.into_iter().min_by_key(|t| (t.created_at, t.seq)) else {
                    debug!("claim_next_queued: nothing dispatchable");
                    return Ok(None);
                };

                task.set_status(TaskStatus::Running, now);
                task.job_handle = None;
                tx.update(&task)?;
                Ok(Some(task))
            })
            .map_err(store_err)?;

        if let Some(ref task) = claimed {
            info!(task_id = %task.id, "Task dispatched");
            self.publish_status(task);
        }
        Ok(claimed)
    }

    fn claim_job(&mut self, id: &str, job_handle: String) -> StateResponse<bool> {
        let claimed = self
            .store
            .transaction(|tx| {
                let Some(mut task) = tx.get::<Task>(id)? else {
                    return Ok(None);
                };
                if task.status != TaskStatus::Running || task.job_handle.is_some() {
                    debug!(%id, status = %task.status, existing = ?task.job_handle, "claim_job: refused");
                    return Ok(Some(false));
                }
                task.job_handle = Some(job_handle);
                task.updated_at = now_ms();
                tx.update(&task)?;
                Ok(Some(true))
            })
            .map_err(store_err)?;
        claimed.ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    fn append_progress(&mut self, record: ProgressRecord) -> StateResponse<ProgressAck> {
        let task_id = record.task_id.clone();
        let ack = self
            .store
            .transaction(|tx| {
                let Some(task) = tx.get::<Task>(&record.task_id)? else {
                    return Ok(None);
                };
                if task.status.is_terminal() {
                    return Ok(Some(ProgressAck::Terminal(task.status)));
                }
                tx.create(record)?;
                Ok(Some(ProgressAck::Recorded))
            })
            .map_err(store_err)?;
        ack.ok_or(StateError::NotFound(task_id))
    }

    fn list_progress(&self, task_id: &str) -> eyre::Result<Vec<ProgressRecord>> {
        let mut records: Vec<ProgressRecord> = self.store.list(&[Filter::eq("task_id", task_id)])?;
        records.sort_by_key(|r| (r.timestamp, r.seq));
        Ok(records)
    }

    fn queue_position(&self, id: &str) -> StateResponse<Option<usize>> {
        let task: Task = self
            .store
            .get(id)
            .map_err(store_err)?
            .ok_or_else(|| StateError::NotFound(id.to_string()))?;
        if !TaskStatus::WAITING.contains(&task.status) {
            return Ok(None);
        }

        let mut waiting = Vec::new();
        for status in TaskStatus::WAITING {
            let mut tasks: Vec<Task> = self
                .store
                .list(&[Filter::eq("status", status.as_str())])
                .map_err(store_err)?;
            waiting.append(&mut tasks);
        }
        Ok(admission::queue_position(&task, &waiting))
    }

    fn average_duration_secs(&self) -> StateResponse<Option<f64>> {
        let completed: Vec<Task> = self
            .store
            .list(&[Filter::eq("status", TaskStatus::Completed.as_str())])
            .map_err(store_err)?;
        let durations: Vec<i64> = completed.iter().filter_map(Task::run_duration_ms).collect();
        if durations.is_empty() {
            return Ok(None);
        }
        let total: i64 = durations.iter().sum();
        Ok(Some(total as f64 / durations.len() as f64 / 1000.0))
    }

    fn counts(&self) -> StateResponse<StatusCounts> {
        let count = |status: TaskStatus| {
            self.store
                .count::<Task>(&[Filter::eq("status", status.as_str())])
                .map_err(store_err)
        };
        Ok(StatusCounts {
            pending: count(TaskStatus::Pending)?,
            queued: count(TaskStatus::Queued)?,
            running: count(TaskStatus::Running)?,
            completed: count(TaskStatus::Completed)?,
            failed: count(TaskStatus::Failed)?,
            cancelled: count(TaskStatus::Cancelled)?,
        })
    }

    fn publish_status(&self, task: &Task) {
        let latest = match self.list_progress(&task.id) {
            Ok(mut records) => records.pop(),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to load progress for status event");
                None
            }
        };
        self.bus.publish(TaskEvent::snapshot(task, latest.as_ref()));
    }

    fn signal(&self, signal: SchedulerSignal) {
        debug!(?signal, "signal: called");
        if self.signals.send(signal).is_err() {
            debug!("signal: scheduler not listening");
        }
    }
}
