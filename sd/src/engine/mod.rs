//! Numeric engine
//!
//! Dense LU factorization with partial pivoting, triangular solves, and the
//! text input contract. Knows nothing about tasks or scheduling.

mod cancel;
pub mod input;
mod lu;

pub use cancel::{CancelReason, CancelToken};
pub use input::{LinearSystem, ValidationError, parse_system, read_system, write_system};
pub use lu::{
    LuFactors, NumericError, Outcome, PhaseRange, Solution, SolveOptions, Stage, back_substitute, decompose,
    forward_substitute, solve,
};
