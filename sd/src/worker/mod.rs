//! Worker execution
//!
//! Runs dispatched tasks through the numeric engine with time limits and
//! cooperative cancellation.

mod registry;
mod runner;

pub use registry::CancelRegistry;
pub use runner::{MSG_INPUT_UNAVAILABLE, MSG_INTERNAL, MSG_SINGULAR, WorkerContext, WorkerError, run_task};
