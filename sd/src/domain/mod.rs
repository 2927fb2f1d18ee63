//! Domain types for solverd
//!
//! Task, ProgressRecord and LogRecord implement the Record trait for
//! TaskStore persistence.

mod progress;
mod task;

pub use progress::{LogLevel, LogRecord, ProgressRecord};
pub use task::{FactorArtifacts, Task, TaskStatus, TransitionOutcome};

// Re-export taskstore types for convenience
pub use taskstore::{Filter, FilterOp, IndexValue, Record, Store};

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    /// Staff may read and cancel any task
    pub is_staff: bool,
}

impl Principal {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_staff: false,
        }
    }

    pub fn staff(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_staff: true,
        }
    }

    /// Owner or staff
    pub fn can_access(&self, task: &Task) -> bool {
        self.is_staff || task.owner == self.user_id
    }
}
