//! Event types for task progress streaming

use serde::{Deserialize, Serialize};

use crate::domain::{ProgressRecord, Task, TaskStatus};

/// Snapshot of a task pushed to subscribers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub status: TaskStatus,
    /// Stage label of the latest progress checkpoint
    pub stage: String,
    pub percentage: f64,
    /// Log line attached to this update, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    /// Seconds, rounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_wait_secs: Option<u64>,
    pub timestamp: i64,
}

impl TaskEvent {
    /// Event reflecting the task's stored state
    pub fn from_task(task: &Task, stage: impl Into<String>, percentage: f64) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            stage: stage.into(),
            percentage,
            log: None,
            result_message: task.result_message.clone(),
            matrix_size: task.matrix_size,
            queue_position: None,
            estimated_wait_secs: None,
            timestamp: taskstore::now_ms(),
        }
    }

    /// Event for the task's current status, using its latest checkpoint
    pub fn snapshot(task: &Task, latest: Option<&ProgressRecord>) -> Self {
        let (stage, percentage) = match (task.status, latest) {
            (TaskStatus::Completed, _) => ("Completed".to_string(), 100.0),
            (TaskStatus::Failed, Some(p)) => ("Failed".to_string(), p.percentage),
            (TaskStatus::Cancelled, Some(p)) => ("Cancelled".to_string(), p.percentage),
            (TaskStatus::Failed, None) => ("Failed".to_string(), 0.0),
            (TaskStatus::Cancelled, None) => ("Cancelled".to_string(), 0.0),
            (_, Some(p)) => (p.stage.clone(), p.percentage),
            (_, None) => ("Pending".to_string(), 0.0),
        };
        Self::from_task(task, stage, percentage)
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub fn with_queue(mut self, position: Option<usize>, wait_secs: Option<f64>) -> Self {
        self.queue_position = position;
        self.estimated_wait_secs = wait_secs.map(|w| w.max(0.0).round() as u64);
        self
    }
}

/// Message delivered on a subscription
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// First message, synthesized from the store
    InitialState(TaskEvent),
    /// Live update relayed from the bus
    Update(TaskEvent),
}

impl PushMessage {
    pub fn event(&self) -> &TaskEvent {
        match self {
            Self::InitialState(event) | Self::Update(event) => event,
        }
    }
}
