//! State management
//!
//! The StateManager actor owns the task store; everything else talks to it
//! through a cloneable handle.

mod manager;
mod messages;

pub use manager::StateManager;
pub use messages::{AdmissionCaps, ProgressAck, StateCommand, StateError, StateResponse, StatusCounts, TaskPatch};
