//! Admission control and queue scheduling
//!
//! Admission decides whether a new task starts Pending or Queued and how long a
//! waiting task is expected to wait. The scheduler promotes Queued tasks to
//! Running whenever a slot frees up.

pub mod admission;
mod config;
mod core;

pub use config::SchedulerConfig;
pub use core::{Scheduler, SchedulerSignal, SchedulerStats};
