//! State manager messages
//!
//! Commands and responses for the actor pattern.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{FactorArtifacts, LogRecord, ProgressRecord, Task, TaskStatus, TransitionOutcome};

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Caps applied when a task is admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionCaps {
    pub global: usize,
    pub per_user: usize,
}

/// Fields written together with a status change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub result_message: Option<String>,
    pub result_artifact: Option<String>,
    pub factor_artifacts: Option<FactorArtifacts>,
}

impl TaskPatch {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            result_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Whether a progress checkpoint was stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressAck {
    Recorded,
    /// The task already finished; nothing was written
    Terminal(TaskStatus),
}

/// Task counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Queued => self.queued,
            TaskStatus::Running => self.running,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Task operations
    AdmitTask {
        task: Task,
        caps: AdmissionCaps,
        reply: oneshot::Sender<StateResponse<Task>>,
    },
    GetTask {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Task>>>,
    },
    ListTasks {
        status_filter: Option<TaskStatus>,
        owner_filter: Option<String>,
        reply: oneshot::Sender<StateResponse<Vec<Task>>>,
    },
    Transition {
        id: String,
        to: TaskStatus,
        patch: TaskPatch,
        reply: oneshot::Sender<StateResponse<TransitionOutcome>>,
    },
    MarkValidated {
        id: String,
        input_artifact: String,
        matrix_size: usize,
        reply: oneshot::Sender<StateResponse<TransitionOutcome>>,
    },

    // Dispatch
    ClaimNextQueued {
        global_cap: usize,
        reply: oneshot::Sender<StateResponse<Option<Task>>>,
    },
    ClaimJob {
        id: String,
        job_handle: String,
        reply: oneshot::Sender<StateResponse<bool>>,
    },

    // Progress and logs
    AppendProgress {
        record: ProgressRecord,
        reply: oneshot::Sender<StateResponse<ProgressAck>>,
    },
    AppendLog {
        record: LogRecord,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListProgress {
        task_id: String,
        reply: oneshot::Sender<StateResponse<Vec<ProgressRecord>>>,
    },
    ListLogs {
        task_id: String,
        reply: oneshot::Sender<StateResponse<Vec<LogRecord>>>,
    },

    // Queue metrics
    QueuePosition {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<usize>>>,
    },
    AverageDuration {
        reply: oneshot::Sender<StateResponse<Option<f64>>>,
    },
    Counts {
        reply: oneshot::Sender<StateResponse<StatusCounts>>,
    },

    // Shutdown
    Shutdown,
}
