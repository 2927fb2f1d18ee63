//! TaskStore - generic persistent record store
//!
//! Records are stored as JSON documents in SQLite, one table for all
//! collections, with a side table of indexed fields for filtered queries.
//!
//! Every write runs inside an `IMMEDIATE` transaction so several processes can
//! share one store file. Callers that need check-then-write semantics (claims,
//! compare-and-swap on a status field) run their whole critical section through
//! [`Store::transaction`].

mod filter;
mod record;
mod store;

pub use filter::{Filter, FilterOp};
pub use record::{IndexValue, Record};
pub use store::{Store, Tx};

/// Current wall-clock time in unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
