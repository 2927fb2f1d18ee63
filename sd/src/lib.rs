//! solverd - admission-controlled dense linear system solver
//!
//! Users submit an augmented matrix `A|b`; solverd validates it, admits the
//! task under global and per-user concurrency caps, schedules it onto a worker,
//! solves `Ax = b` by LU decomposition with partial pivoting and streams
//! progress to subscribers while it runs.
//!
//! # Modules
//!
//! - [`engine`] - Input parsing and the LU solver
//! - [`domain`] - Task, progress and log records
//! - [`state`] - Store-owning actor with transactional lifecycle operations
//! - [`scheduler`] - Admission rules and the dispatch loop
//! - [`events`] - Per-task progress bus
//! - [`worker`] - Job execution with time limits and cancellation
//! - [`service`] - Facade tying the pieces together
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod artifacts;
pub mod capacity;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod events;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod worker;

// Re-export commonly used types
pub use artifacts::ArtifactStore;
pub use capacity::{CapacitySignal, desired_replicas};
pub use config::Config;
pub use domain::{
    Filter, FilterOp, IndexValue, LogLevel, LogRecord, Principal, ProgressRecord, Record, Store, Task, TaskStatus,
    TransitionOutcome,
};
pub use engine::{
    CancelReason, CancelToken, LinearSystem, LuFactors, NumericError, Outcome, Solution, SolveOptions,
    ValidationError, parse_system, solve,
};
pub use events::{ProgressBus, PushMessage, TaskEvent};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerSignal};
pub use service::{ServiceError, SolverService, SubmitReceipt, SubmitRequest, SubscribeError, Subscription, TaskView};
pub use state::{StateError, StateManager, StateResponse};
pub use worker::{CancelRegistry, WorkerContext, WorkerError, run_task};
