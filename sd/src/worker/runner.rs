//! Worker execution wrapper
//!
//! Drives one Running task through the numeric engine. The engine runs on a
//! blocking thread; its progress callback only pushes into an unbounded channel
//! drained by an async relay that persists checkpoints, writes throttled log
//! lines and publishes bus events.
//!
//! Whatever happens (numeric failure, timeout, missing input, panic), the task
//! ends in a terminal status before `run_task` returns.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::config::LimitsConfig;
use crate::domain::{FactorArtifacts, LogRecord, ProgressRecord, Task, TaskStatus, TransitionOutcome};
use crate::engine::{self, CancelReason, CancelToken, NumericError, Outcome, Solution, SolveOptions, Stage};
use crate::events::{ProgressBus, TaskEvent};
use crate::state::{ProgressAck, StateManager, TaskPatch};

use super::registry::CancelRegistry;

pub const MSG_SINGULAR: &str = "Matrix is singular or nearly singular; the system has no unique solution";
pub const MSG_INPUT_UNAVAILABLE: &str = "Input data is unavailable";
pub const MSG_INTERNAL: &str = "Internal error while computing the solution";

/// Why a job did not produce a solution
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Input unavailable: {0}")]
    MissingInput(String),

    #[error(transparent)]
    Numeric(#[from] NumericError),

    #[error("Soft time limit of {}s exceeded", .0.as_secs())]
    SoftTimeout(Duration),

    #[error("Hard time limit of {}s exceeded", .0.as_secs())]
    HardTimeout(Duration),

    #[error("Cancelled: {0:?}")]
    Cancelled(CancelReason),

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),
}

/// Everything a job needs besides the task
#[derive(Clone)]
pub struct WorkerContext {
    pub state: StateManager,
    pub bus: Arc<ProgressBus>,
    pub artifacts: ArtifactStore,
    pub cancels: CancelRegistry,
    pub limits: LimitsConfig,
    /// Percentage points between progress log lines
    pub progress_log_step: f64,
}

/// Artifacts of a successful computation
#[derive(Debug)]
struct Solved {
    n: usize,
    result_path: String,
    factors: Option<FactorArtifacts>,
}

/// Run a task the scheduler promoted to Running
///
/// Returns the task's final status (or its current one if another job owns it).
pub async fn run_task(ctx: WorkerContext, task: Task) -> TaskStatus {
    let job_handle = format!("job-{}", uuid::Uuid::now_v7());
    info!(task_id = %task.id, %job_handle, "Worker picked up task");

    match ctx.state.claim_job(&task.id, &job_handle).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(task_id = %task.id, "run_task: claim refused, another job owns the task");
            return task.status;
        }
        Err(e) => {
            error!(task_id = %task.id, error = %e, "Failed to claim task");
            return finish(&ctx, &task, Err(WorkerError::Infrastructure(e.to_string()))).await;
        }
    }

    // The task may have been cancelled between dispatch and claim
    let current = match ctx.state.get_task_required(&task.id).await {
        Ok(current) => current,
        Err(e) => {
            error!(task_id = %task.id, error = %e, "Failed to reload claimed task");
            return finish(&ctx, &task, Err(WorkerError::Infrastructure(e.to_string()))).await;
        }
    };
    if current.status != TaskStatus::Running {
        info!(task_id = %task.id, status = %current.status, "Task no longer running, skipping");
        return current.status;
    }

    let token = ctx.cancels.register(&current.id);
    let result = execute(&ctx, &current, &token).await;
    let status = finish(&ctx, &current, result).await;
    ctx.cancels.unregister(&current.id);

    info!(task_id = %current.id, %status, "Worker finished task");
    status
}

async fn execute(ctx: &WorkerContext, task: &Task, token: &CancelToken) -> Result<Solved, WorkerError> {
    debug!(task_id = %task.id, "execute: called");
    let input = task
        .input_artifact
        .clone()
        .ok_or_else(|| WorkerError::MissingInput("no input artifact recorded".to_string()))?;
    let options = SolveOptions::task_phases(task.save_factors);

    if let Some(n) = task.matrix_size {
        append_log(ctx, LogRecord::info(&task.id, format!("Starting LU decomposition for {}x{} system", n, n))).await;
    }

    let (progress_tx, progress_rx) = mpsc::unbounded_channel::<(Stage, f64)>();
    let relay = tokio::spawn(relay_progress(ctx.clone(), task.clone(), progress_rx, token.clone()));

    let job_token = token.clone();
    let mut job = tokio::task::spawn_blocking(move || -> Result<Outcome<Solution>, WorkerError> {
        let system = engine::read_system(Path::new(&input)).map_err(|e| WorkerError::MissingInput(format!("{:#}", e)))?;
        let mut progress = |stage: Stage, pct: f64| {
            let _ = progress_tx.send((stage, pct));
        };
        Ok(engine::solve(&system.a, &system.b, options, &mut progress, &job_token)?)
    });

    let soft = ctx.limits.soft_limit();
    let grace = ctx.limits.hard_limit().saturating_sub(soft);
    let joined = tokio::select! {
        joined = &mut job => joined,
        _ = tokio::time::sleep(soft) => {
            warn!(task_id = %task.id, "Soft time limit reached, requesting cancellation");
            token.cancel(CancelReason::SoftTimeout);
            match tokio::time::timeout(grace, &mut job).await {
                Ok(joined) => joined,
                Err(_) => {
                    error!(task_id = %task.id, "Hard time limit reached, abandoning job");
                    return Err(WorkerError::HardTimeout(ctx.limits.hard_limit()));
                }
            }
        }
    };

    // The relay ends once the job drops its sender; wait so every checkpoint
    // lands before the terminal transition
    if let Err(e) = relay.await {
        warn!(task_id = %task.id, error = %e, "Progress relay failed");
    }

    let outcome = joined.map_err(|e| WorkerError::Panicked(e.to_string()))??;
    let solution = match outcome {
        Outcome::Done(solution) => solution,
        Outcome::Cancelled => {
            return Err(match token.reason() {
                Some(CancelReason::SoftTimeout) => WorkerError::SoftTimeout(soft),
                Some(reason) => WorkerError::Cancelled(reason),
                None => WorkerError::Cancelled(CancelReason::Requested),
            });
        }
    };

    let result_path = ctx
        .artifacts
        .write_solution(&task.id, &solution.x)
        .map_err(|e| WorkerError::Infrastructure(format!("{:#}", e)))?;
    let factors = match &solution.factors {
        Some(factors) => Some(
            ctx.artifacts
                .write_factors(&task.id, factors)
                .map_err(|e| WorkerError::Infrastructure(format!("{:#}", e)))?,
        ),
        None => None,
    };

    Ok(Solved {
        n: solution.x.len(),
        result_path: result_path.to_string_lossy().into_owned(),
        factors,
    })
}

/// Persist, log and publish engine checkpoints
async fn relay_progress(
    ctx: WorkerContext,
    task: Task,
    mut rx: mpsc::UnboundedReceiver<(Stage, f64)>,
    token: CancelToken,
) {
    debug!(task_id = %task.id, "relay_progress: called");
    let step = ctx.progress_log_step;
    let mut next_log = 0.0;
    let mut stopped = false;

    while let Some((stage, pct)) = rx.recv().await {
        if stopped {
            continue;
        }

        match ctx
            .state
            .append_progress(ProgressRecord::new(&task.id, stage.label(), pct))
            .await
        {
            Ok(ProgressAck::Recorded) => {}
            Ok(ProgressAck::Terminal(status)) => {
                info!(task_id = %task.id, %status, "Task finished elsewhere, stopping computation");
                token.cancel(CancelReason::Superseded);
                stopped = true;
                continue;
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "Failed to record progress"),
        }

        let mut event = TaskEvent::from_task(&task, stage.label(), pct);
        if pct >= next_log {
            let line = format!("{}: {:.0}%", stage.label(), pct);
            append_log(&ctx, LogRecord::info(&task.id, &line)).await;
            event = event.with_log(line);
            next_log = if step > 0.0 { (pct / step).floor() * step + step } else { pct };
        }
        ctx.bus.publish(event);
    }
}

/// Record the final status for a job result
async fn finish(ctx: &WorkerContext, task: &Task, result: Result<Solved, WorkerError>) -> TaskStatus {
    let id = task.id.as_str();
    let (to, patch, log) = match result {
        Ok(solved) => {
            let log = LogRecord::info(id, format!("Solution written to {}", solved.result_path));
            let patch = TaskPatch {
                result_message: Some(format!("Solved {}x{} system", solved.n, solved.n)),
                result_artifact: Some(solved.result_path),
                factor_artifacts: solved.factors,
            };
            (TaskStatus::Completed, patch, log)
        }
        Err(WorkerError::Cancelled(reason)) => {
            let log = LogRecord::warn(id, format!("Computation stopped ({:?})", reason));
            (TaskStatus::Cancelled, TaskPatch::default(), log)
        }
        Err(WorkerError::Numeric(NumericError::Singular { step, pivot })) => {
            let log = LogRecord::error(id, format!("Singular matrix: pivot {:e} at elimination step {}", pivot, step));
            (TaskStatus::Failed, TaskPatch::message(MSG_SINGULAR), log)
        }
        Err(WorkerError::Numeric(e)) => {
            let message = format!("Numeric error: {}", e);
            (TaskStatus::Failed, TaskPatch::message(&message), LogRecord::error(id, message))
        }
        Err(e @ (WorkerError::SoftTimeout(_) | WorkerError::HardTimeout(_))) => {
            let message = format!(
                "Computation exceeded the time limit of {}s",
                ctx.limits.soft_limit().as_secs()
            );
            (TaskStatus::Failed, TaskPatch::message(message), LogRecord::error(id, e.to_string()))
        }
        Err(e @ WorkerError::MissingInput(_)) => {
            error!(task_id = %id, error = %e, "Task input missing");
            (
                TaskStatus::Failed,
                TaskPatch::message(MSG_INPUT_UNAVAILABLE),
                LogRecord::error(id, e.to_string()),
            )
        }
        Err(e) => {
            error!(task_id = %id, error = %e, "Task failed unexpectedly");
            (TaskStatus::Failed, TaskPatch::message(MSG_INTERNAL), LogRecord::error(id, e.to_string()))
        }
    };

    append_log(ctx, log).await;

    match ctx.state.transition(id, to, patch).await {
        Ok(TransitionOutcome::Applied(status)) | Ok(TransitionOutcome::AlreadyTerminal(status)) => status,
        Ok(TransitionOutcome::Rejected { from, to }) => {
            warn!(task_id = %id, %from, %to, "Final transition rejected");
            from
        }
        Err(e) => {
            error!(task_id = %id, error = %e, "Failed to record final status, retrying as failed");
            match ctx
                .state
                .transition(id, TaskStatus::Failed, TaskPatch::message(MSG_INTERNAL))
                .await
            {
                Ok(TransitionOutcome::Applied(status)) | Ok(TransitionOutcome::AlreadyTerminal(status)) => status,
                Ok(TransitionOutcome::Rejected { from, .. }) => from,
                Err(e) => {
                    error!(task_id = %id, error = %e, "Task left without a final status");
                    task.status
                }
            }
        }
    }
}

async fn append_log(ctx: &WorkerContext, record: LogRecord) {
    if let Err(e) = ctx.state.append_log(record).await {
        warn!(error = %e, "Failed to write task log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LogLevel, Store};
    use crate::engine::{LinearSystem, write_system};
    use crate::scheduler::SchedulerSignal;
    use crate::state::AdmissionCaps;
    use approx::assert_relative_eq;
    use ndarray::{Array1, Array2, array};
    use tempfile::TempDir;

    const CAPS: AdmissionCaps = AdmissionCaps { global: 10, per_user: 10 };

    struct Harness {
        ctx: WorkerContext,
        _signals: mpsc::UnboundedReceiver<SchedulerSignal>,
        temp: TempDir,
    }

    fn harness(limits: LimitsConfig) -> Harness {
        let temp = TempDir::new().unwrap();
        let bus = Arc::new(ProgressBus::default());
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let state = StateManager::spawn_with_store(Store::open_in_memory().unwrap(), bus.clone(), signal_tx);
        let ctx = WorkerContext {
            state,
            bus,
            artifacts: ArtifactStore::new(temp.path().join("artifacts")),
            cancels: CancelRegistry::new(),
            limits,
            progress_log_step: 10.0,
        };
        Harness {
            ctx,
            _signals: signal_rx,
            temp,
        }
    }

    /// Admit, validate and dispatch a task for `system`
    async fn running_task(h: &Harness, system: &LinearSystem, save_factors: bool) -> Task {
        let task = Task::new("alice", 1000).with_save_factors(save_factors);
        let task = h.ctx.state.admit_task(task, CAPS).await.unwrap();
        let path = h.ctx.artifacts.write_input(&task.id, system).unwrap();
        h.ctx
            .state
            .mark_validated(&task.id, path.to_string_lossy().into_owned(), system.n())
            .await
            .unwrap();
        h.ctx.state.claim_next_queued(10).await.unwrap().unwrap()
    }

    fn large_system(n: usize) -> LinearSystem {
        let mut a = Array2::from_shape_fn((n, n), |(i, j)| ((i * 7 + j * 13) % 17) as f64 / 17.0);
        for i in 0..n {
            a[[i, i]] += n as f64;
        }
        LinearSystem {
            a,
            b: Array1::from_elem(n, 1.0),
        }
    }

    #[tokio::test]
    async fn test_success_writes_solution() {
        let h = harness(LimitsConfig::default());
        let system = LinearSystem {
            a: array![[2.0, 1.0], [1.0, 3.0]],
            b: array![3.0, 5.0],
        };
        let task = running_task(&h, &system, true).await;

        let status = run_task(h.ctx.clone(), task.clone()).await;
        assert_eq!(status, TaskStatus::Completed);

        let stored = h.ctx.state.get_task_required(&task.id).await.unwrap();
        let path = stored.result_artifact.clone().unwrap();
        let x = ArtifactStore::read_solution(Path::new(&path)).unwrap();
        assert_relative_eq!(x[0], 0.8, epsilon = 1e-12);
        assert_relative_eq!(x[1], 1.4, epsilon = 1e-12);
        assert!(stored.factor_artifacts.is_some());
        assert!(stored.job_handle.is_some());

        let progress = h.ctx.state.list_progress(&task.id).await.unwrap();
        assert_relative_eq!(progress.first().unwrap().percentage, 10.0);
        assert_relative_eq!(progress.last().unwrap().percentage, 100.0);
        assert!(progress.windows(2).all(|w| w[0].percentage <= w[1].percentage));

        let logs = h.ctx.state.list_logs(&task.id).await.unwrap();
        assert!(logs.iter().any(|l| l.message.starts_with("Solution written")));
        assert!(h.ctx.cancels.is_empty());
    }

    #[tokio::test]
    async fn test_singular_matrix_fails() {
        let h = harness(LimitsConfig::default());
        let system = LinearSystem {
            a: array![[1.0, 2.0], [2.0, 4.0]],
            b: array![1.0, 2.0],
        };
        let task = running_task(&h, &system, false).await;

        assert_eq!(run_task(h.ctx.clone(), task.clone()).await, TaskStatus::Failed);
        let stored = h.ctx.state.get_task_required(&task.id).await.unwrap();
        assert_eq!(stored.result_message.as_deref(), Some(MSG_SINGULAR));
        assert!(stored.result_artifact.is_none());
    }

    #[tokio::test]
    async fn test_missing_input_fails() {
        let h = harness(LimitsConfig::default());
        let system = LinearSystem {
            a: array![[1.0]],
            b: array![1.0],
        };
        let task = running_task(&h, &system, false).await;
        std::fs::remove_file(task.input_artifact.as_ref().unwrap()).unwrap();

        assert_eq!(run_task(h.ctx.clone(), task.clone()).await, TaskStatus::Failed);
        let stored = h.ctx.state.get_task_required(&task.id).await.unwrap();
        assert_eq!(stored.result_message.as_deref(), Some(MSG_INPUT_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_soft_timeout_fails_task() {
        let limits = LimitsConfig {
            max_n: 1000,
            soft_time_limit_secs: 0,
            hard_time_limit_grace_secs: 30,
        };
        let h = harness(limits);
        let task = running_task(&h, &large_system(300), false).await;

        assert_eq!(run_task(h.ctx.clone(), task.clone()).await, TaskStatus::Failed);
        let stored = h.ctx.state.get_task_required(&task.id).await.unwrap();
        assert!(stored.result_message.unwrap().contains("time limit"));
        assert!(stored.result_artifact.is_none());
    }

    #[tokio::test]
    async fn test_hard_timeout_abandons_job() {
        let limits = LimitsConfig {
            max_n: 1000,
            soft_time_limit_secs: 0,
            hard_time_limit_grace_secs: 0,
        };
        let h = harness(limits);
        let task = running_task(&h, &large_system(400), false).await;

        assert_eq!(run_task(h.ctx.clone(), task.clone()).await, TaskStatus::Failed);
        let stored = h.ctx.state.get_task_required(&task.id).await.unwrap();
        assert_eq!(
            stored.result_message.as_deref(),
            Some("Computation exceeded the time limit of 0s")
        );
        assert!(stored.result_artifact.is_none());

        let logs = h.ctx.state.list_logs(&task.id).await.unwrap();
        assert!(
            logs.iter()
                .any(|l| l.level == LogLevel::Error && l.message.starts_with("Hard time limit")),
            "{:?}",
            logs.iter().map(|l| &l.message).collect::<Vec<_>>()
        );
        assert!(h.ctx.cancels.is_empty());
    }

    #[tokio::test]
    async fn test_second_claim_is_skipped() {
        let h = harness(LimitsConfig::default());
        let system = LinearSystem {
            a: array![[1.0]],
            b: array![2.0],
        };
        let task = running_task(&h, &system, false).await;
        assert!(h.ctx.state.claim_job(&task.id, "job-other").await.unwrap());

        assert_eq!(run_task(h.ctx.clone(), task.clone()).await, TaskStatus::Running);
        let stored = h.ctx.state.get_task_required(&task.id).await.unwrap();
        assert_eq!(stored.job_handle.as_deref(), Some("job-other"));
    }

    #[tokio::test]
    async fn test_relay_stops_after_external_cancel() {
        let h = harness(LimitsConfig::default());
        let task = running_task(&h, &large_system(4), false).await;
        let token = CancelToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = tokio::spawn(relay_progress(h.ctx.clone(), task.clone(), rx, token.clone()));

        tx.send((Stage::Decomposition, 10.0)).unwrap();
        // Wait until the first checkpoint is stored
        for _ in 0..100 {
            if !h.ctx.state.list_progress(&task.id).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.ctx
            .state
            .transition(&task.id, TaskStatus::Cancelled, TaskPatch::default())
            .await
            .unwrap();
        tx.send((Stage::Decomposition, 50.0)).unwrap();
        tx.send((Stage::Decomposition, 90.0)).unwrap();
        drop(tx);
        relay.await.unwrap();

        assert_eq!(token.reason(), Some(CancelReason::Superseded));
        let progress = h.ctx.state.list_progress(&task.id).await.unwrap();
        assert_eq!(progress.len(), 1);
        assert_relative_eq!(progress[0].percentage, 10.0);
        assert!(h.temp.path().exists());
    }
}
