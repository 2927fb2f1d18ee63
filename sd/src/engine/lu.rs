//! LU decomposition with partial pivoting and triangular solves
//!
//! Produces P, L, U with `P·A = L·U` (L unit lower triangular, U upper
//! triangular) and solves `A·x = b` through `L·y = P·b`, `U·x = y`.
//!
//! Progress is reported through a caller-supplied callback at checkpoints
//! (phase start, roughly every 5% of elimination steps, the last step, and
//! after each triangular solve). The cancellation token is checked right after
//! every report.

use ndarray::{Array1, Array2};
use thiserror::Error;
use tracing::debug;

use super::cancel::CancelToken;

/// Numeric failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericError {
    #[error("Matrix must be square and non-empty, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Matrix is singular or degenerate (pivot {pivot:e} at step {step})")]
    Singular { step: usize, pivot: f64 },

    #[error("Input or result contains NaN or infinite values")]
    NonFinite,
}

/// Phase a progress report belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decomposition,
    Solve,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Decomposition => "LU decomposition",
            Self::Solve => "Solving system",
        }
    }
}

/// Sub-range of overall progress assigned to a phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseRange {
    pub start: f64,
    pub end: f64,
}

impl PhaseRange {
    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Map a phase fraction in [0, 1] onto this range
    pub fn scale(&self, fraction: f64) -> f64 {
        self.start + (self.end - self.start) * fraction.clamp(0.0, 1.0)
    }
}

/// Engine options
#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub decomposition: PhaseRange,
    pub solve: PhaseRange,
    /// Return L, U and the permutation alongside x
    pub keep_factors: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            decomposition: PhaseRange::new(0.0, 80.0),
            solve: PhaseRange::new(80.0, 100.0),
            keep_factors: false,
        }
    }
}

impl SolveOptions {
    /// Phase ranges on the composite task scale (parse 0-10, LU 10-90, solve 90-100)
    pub fn task_phases(keep_factors: bool) -> Self {
        Self {
            decomposition: PhaseRange::new(10.0, 90.0),
            solve: PhaseRange::new(90.0, 100.0),
            keep_factors,
        }
    }
}

/// Result of a computation that may be cancelled
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Done(T),
    Cancelled,
}

/// Factors of `P·A = L·U`
#[derive(Debug, Clone, PartialEq)]
pub struct LuFactors {
    pub l: Array2<f64>,
    pub u: Array2<f64>,
    /// Row `i` of `P·A` is row `perm[i]` of `A`
    pub perm: Vec<usize>,
}

impl LuFactors {
    pub fn n(&self) -> usize {
        self.perm.len()
    }

    /// Dense permutation matrix P
    pub fn p(&self) -> Array2<f64> {
        let n = self.n();
        let mut p = Array2::zeros((n, n));
        for (i, &j) in self.perm.iter().enumerate() {
            p[[i, j]] = 1.0;
        }
        p
    }

    /// Apply P to a vector
    pub fn permute(&self, b: &Array1<f64>) -> Array1<f64> {
        self.perm.iter().map(|&i| b[i]).collect()
    }

    /// max|P·A − L·U| relative to max(max|A|, 1)
    pub fn reconstruct_error(&self, a: &Array2<f64>) -> f64 {
        let lu = self.l.dot(&self.u);
        let n = self.n();
        let mut worst: f64 = 0.0;
        for i in 0..n {
            for j in 0..n {
                worst = worst.max((a[[self.perm[i], j]] - lu[[i, j]]).abs());
            }
        }
        let scale = a.iter().fold(1.0_f64, |m, v| m.max(v.abs()));
        worst / scale
    }
}

/// Solution of `A·x = b`
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub x: Array1<f64>,
    pub factors: Option<LuFactors>,
}

/// Factor `A` as `P·A = L·U`
pub fn decompose(
    a: &Array2<f64>,
    range: PhaseRange,
    progress: &mut dyn FnMut(Stage, f64),
    cancel: &CancelToken,
) -> Result<Outcome<LuFactors>, NumericError> {
    let n = a.nrows();
    debug!(n, "decompose: called");
    if n == 0 || a.ncols() != n {
        return Err(NumericError::NotSquare { rows: n, cols: a.ncols() });
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(NumericError::NonFinite);
    }

    let scale = a.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let tolerance = n as f64 * f64::EPSILON * scale;

    let mut work = a.clone();
    let mut l = Array2::<f64>::zeros((n, n));
    let mut u = Array2::<f64>::zeros((n, n));
    let mut perm: Vec<usize> = (0..n).collect();
    let report_every = (n / 20).max(1);

    progress(Stage::Decomposition, range.scale(0.0));
    if cancel.is_cancelled() {
        debug!("decompose: cancelled before first step");
        return Ok(Outcome::Cancelled);
    }

    for k in 0..n {
        let (pivot_row, pivot_abs) = (k..n)
            .map(|i| (i, work[[i, k]].abs()))
            .fold((k, -1.0), |best, cand| if cand.1 > best.1 { cand } else { best });

        if scale == 0.0 || pivot_abs <= tolerance {
            debug!(step = k, pivot_abs, tolerance, "decompose: vanishing pivot");
            return Err(NumericError::Singular {
                step: k,
                pivot: work[[pivot_row, k]],
            });
        }

        if pivot_row != k {
            for j in 0..n {
                work.swap([k, j], [pivot_row, j]);
            }
            for j in 0..k {
                l.swap([k, j], [pivot_row, j]);
            }
            perm.swap(k, pivot_row);
        }

        l[[k, k]] = 1.0;
        let pivot = work[[k, k]];
        for i in (k + 1)..n {
            let factor = work[[i, k]] / pivot;
            l[[i, k]] = factor;
            if factor == 0.0 {
                continue;
            }
            for j in k..n {
                let update = factor * work[[k, j]];
                work[[i, j]] -= update;
            }
        }

        for j in k..n {
            u[[k, j]] = work[[k, j]];
        }

        if k % report_every == 0 || k == n - 1 {
            progress(Stage::Decomposition, range.scale((k + 1) as f64 / n as f64));
            if cancel.is_cancelled() {
                debug!(step = k, "decompose: cancelled at checkpoint");
                return Ok(Outcome::Cancelled);
            }
        }
    }

    Ok(Outcome::Done(LuFactors { l, u, perm }))
}

/// Solve `L·y = b` for unit lower triangular L
pub fn forward_substitute(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[[i, j]] * y[j];
        }
        y[i] = sum;
    }
    y
}

/// Solve `U·x = y` for upper triangular U
pub fn back_substitute(u: &Array2<f64>, y: &Array1<f64>) -> Result<Array1<f64>, NumericError> {
    let n = y.len();
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let diag = u[[i, i]];
        if diag == 0.0 {
            return Err(NumericError::Singular { step: i, pivot: diag });
        }
        let mut sum = y[i];
        for j in (i + 1)..n {
            sum -= u[[i, j]] * x[j];
        }
        x[i] = sum / diag;
    }
    Ok(x)
}

/// Solve `A·x = b`
pub fn solve(
    a: &Array2<f64>,
    b: &Array1<f64>,
    options: SolveOptions,
    progress: &mut dyn FnMut(Stage, f64),
    cancel: &CancelToken,
) -> Result<Outcome<Solution>, NumericError> {
    debug!(n = a.nrows(), ?options, "solve: called");
    if b.len() != a.nrows() {
        return Err(NumericError::DimensionMismatch {
            expected: a.nrows(),
            got: b.len(),
        });
    }
    if b.iter().any(|v| !v.is_finite()) {
        return Err(NumericError::NonFinite);
    }

    let factors = match decompose(a, options.decomposition, progress, cancel)? {
        Outcome::Done(factors) => factors,
        Outcome::Cancelled => return Ok(Outcome::Cancelled),
    };

    let pb = factors.permute(b);
    let y = forward_substitute(&factors.l, &pb);
    progress(Stage::Solve, options.solve.scale(0.5));
    if cancel.is_cancelled() {
        debug!("solve: cancelled after forward substitution");
        return Ok(Outcome::Cancelled);
    }

    let x = back_substitute(&factors.u, &y)?;
    if x.iter().any(|v| !v.is_finite()) {
        return Err(NumericError::NonFinite);
    }
    progress(Stage::Solve, options.solve.scale(1.0));

    Ok(Outcome::Done(Solution {
        x,
        factors: options.keep_factors.then_some(factors),
    }))
}
