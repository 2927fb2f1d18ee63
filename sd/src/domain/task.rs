//! Task domain type
//!
//! One solve request and its lifecycle.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use taskstore::{IndexValue, Record, now_ms};
use tracing::debug;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Admitted, waiting for the input to be validated
    #[default]
    Pending,
    /// Validated (or admitted over capacity), waiting for a slot
    Queued,
    /// Claimed by the scheduler, computation in progress
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Pending,
        Self::Queued,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Statuses that count against admission caps
    pub const ACTIVE: [TaskStatus; 3] = [Self::Pending, Self::Queued, Self::Running];

    /// Statuses that have a queue position
    pub const WAITING: [TaskStatus; 2] = [Self::Pending, Self::Queued];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the lifecycle graph has an edge `self -> next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("Unknown task status: {}", s))
    }
}

/// Result of a status-changing operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Status changed (and was persisted)
    Applied(TaskStatus),
    /// Task was already terminal; nothing changed
    AlreadyTerminal(TaskStatus),
    /// `from -> to` is not an edge of the lifecycle graph
    Rejected { from: TaskStatus, to: TaskStatus },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Paths of the stored factorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorArtifacts {
    pub l: String,
    pub u: String,
    pub p: String,
}

/// A dense linear-system solve request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// External id (UUID v7)
    pub id: String,

    /// Insert sequence assigned by the store
    #[serde(default)]
    pub seq: i64,

    /// Owning user id
    pub owner: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    pub status: TaskStatus,

    /// Matrix dimension, known once the input parsed
    #[serde(default)]
    pub matrix_size: Option<usize>,

    /// Largest accepted dimension
    pub max_n: usize,

    /// Persist L, U and P next to the result
    #[serde(default)]
    pub save_factors: bool,

    /// Validated A|b text
    #[serde(default)]
    pub input_artifact: Option<String>,

    /// Solution vector file, set once Completed
    #[serde(default)]
    pub result_artifact: Option<String>,

    #[serde(default)]
    pub factor_artifacts: Option<FactorArtifacts>,

    #[serde(default)]
    pub result_message: Option<String>,

    /// Worker job that owns the computation
    #[serde(default)]
    pub job_handle: Option<String>,

    pub created_at: i64,

    #[serde(default)]
    pub started_at: Option<i64>,

    #[serde(default)]
    pub completed_at: Option<i64>,

    pub updated_at: i64,
}

impl Task {
    pub fn new(owner: impl Into<String>, max_n: usize) -> Self {
        let now = now_ms();
        let task = Self {
            id: uuid::Uuid::now_v7().to_string(),
            seq: 0,
            owner: owner.into(),
            name: None,
            description: None,
            status: TaskStatus::Pending,
            matrix_size: None,
            max_n,
            save_factors: false,
            input_artifact: None,
            result_artifact: None,
            factor_artifacts: None,
            result_message: None,
            job_handle: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        debug!(id = %task.id, owner = %task.owner, "Task::new: called");
        task
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_save_factors(mut self, save_factors: bool) -> Self {
        self.save_factors = save_factors;
        self
    }

    /// Apply a status change in memory, latching timestamps
    ///
    /// Does not consult the lifecycle graph; callers check
    /// [`TaskStatus::can_transition_to`] first.
    pub fn set_status(&mut self, next: TaskStatus, now: i64) {
        debug!(id = %self.id, from = %self.status, to = %next, "Task::set_status: called");
        self.status = next;
        if next == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Wall-clock run time for completed tasks
    pub fn run_duration_ms(&self) -> Option<i64> {
        match (self.status, self.started_at, self.completed_at) {
            (TaskStatus::Completed, Some(start), Some(end)) => Some((end - start).max(0)),
            _ => None,
        }
    }

    /// Ready for dispatch: queued with a validated input
    pub fn is_dispatchable(&self) -> bool {
        self.status == TaskStatus::Queued && self.input_artifact.is_some()
    }
}

impl Record for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "tasks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("owner".to_string(), IndexValue::String(self.owner.clone()));
        fields.insert("created_at".to_string(), IndexValue::Int(self.created_at));
        fields.insert("has_input".to_string(), IndexValue::Bool(self.input_artifact.is_some()));
        fields
    }

    fn set_seq(&mut self, seq: i64) {
        self.seq = seq;
    }
}
