//! Input contract for linear systems
//!
//! Text form: one row per line, whitespace separated numbers. The last column
//! is `b`, the remaining columns form the square matrix `A`. Blank lines are
//! ignored.

use std::fmt::Write as _;
use std::path::Path;

use eyre::{Context, Result};
use ndarray::{Array1, Array2};
use thiserror::Error;
use tracing::debug;

/// Reasons an input is rejected before it reaches the queue
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Input is empty")]
    Empty,

    #[error("Invalid number '{token}' on line {line}")]
    InvalidNumber { line: usize, token: String },

    #[error("Non-finite value on line {line}")]
    NonFinite { line: usize },

    #[error("Line {line} has {got} columns, expected {expected}")]
    RaggedRows { line: usize, expected: usize, got: usize },

    #[error("Need at least 2 columns (matrix and right-hand side), got {0}")]
    TooFewColumns(usize),

    #[error("Matrix must be square: {rows} rows for {cols} matrix columns")]
    NotSquare { rows: usize, cols: usize },

    #[error("Matrix size {n} exceeds the maximum of {max_n}")]
    TooLarge { n: usize, max_n: usize },
}

/// A parsed `A·x = b` system
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSystem {
    pub a: Array2<f64>,
    pub b: Array1<f64>,
}

impl LinearSystem {
    pub fn n(&self) -> usize {
        self.b.len()
    }

    /// Render as `A|b` text that parses back to the same values
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (i, row) in self.a.rows().into_iter().enumerate() {
            for value in row.iter() {
                let _ = write!(out, "{:.17e} ", value);
            }
            let _ = writeln!(out, "{:.17e}", self.b[i]);
        }
        out
    }
}

/// Parse and validate `A|b` text
pub fn parse_system(text: &str, max_n: usize) -> Result<LinearSystem, ValidationError> {
    debug!(len = text.len(), max_n, "parse_system: called");
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut width: Option<usize> = None;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }

        // The first row fixes the size; stop before buffering an oversized one
        if width.is_none() {
            let columns = line.split_whitespace().count();
            if columns > max_n.saturating_add(1) {
                return Err(ValidationError::TooLarge { n: columns - 1, max_n });
            }
        }

        let mut row = Vec::new();
        for token in line.split_whitespace() {
            let value: f64 = token.parse().map_err(|_| ValidationError::InvalidNumber {
                line: line_no,
                token: token.to_string(),
            })?;
            if !value.is_finite() {
                return Err(ValidationError::NonFinite { line: line_no });
            }
            row.push(value);
        }

        match width {
            None => width = Some(row.len()),
            Some(expected) if expected != row.len() => {
                return Err(ValidationError::RaggedRows {
                    line: line_no,
                    expected,
                    got: row.len(),
                });
            }
            Some(_) => {}
        }
        rows.push(row);
        if rows.len() > max_n {
            return Err(ValidationError::TooLarge { n: rows.len(), max_n });
        }
    }

    let width = width.ok_or(ValidationError::Empty)?;
    if width < 2 {
        return Err(ValidationError::TooFewColumns(width));
    }
    let n = width - 1;
    if rows.len() != n {
        return Err(ValidationError::NotSquare { rows: rows.len(), cols: n });
    }

    let a = Array2::from_shape_fn((n, n), |(i, j)| rows[i][j]);
    let b = Array1::from_shape_fn(n, |i| rows[i][n]);
    debug!(n, "parse_system: accepted");
    Ok(LinearSystem { a, b })
}

/// Write a validated system to disk
pub fn write_system(path: &Path, system: &LinearSystem) -> Result<()> {
    debug!(path = %path.display(), n = system.n(), "write_system: called");
    std::fs::write(path, system.to_text()).context(format!("Failed to write {}", path.display()))
}

/// Read a previously validated system back from disk
pub fn read_system(path: &Path) -> Result<LinearSystem> {
    debug!(path = %path.display(), "read_system: called");
    let text = std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
    parse_system(&text, usize::MAX).context(format!("Stored input {} is invalid", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    #[test]
    fn test_parse_two_by_two() {
        let system = parse_system("2 1 3\n1 3 5\n", 10).unwrap();
        assert_eq!(system.a, array![[2.0, 1.0], [1.0, 3.0]]);
        assert_eq!(system.b, array![3.0, 5.0]);
    }

    #[test]
    fn test_blank_lines_and_spacing_ignored() {
        let system = parse_system("\n  2\t1   3\n\n1 3 5  \n\n", 10).unwrap();
        assert_eq!(system.n(), 2);
    }

    #[test]
    fn test_rejections() {
        assert_eq!(parse_system("", 10), Err(ValidationError::Empty));
        assert_eq!(parse_system(" \n\n", 10), Err(ValidationError::Empty));
        assert_eq!(parse_system("5\n", 10), Err(ValidationError::TooFewColumns(1)));
        assert_eq!(
            parse_system("1 2 3\n4 5\n", 10),
            Err(ValidationError::RaggedRows {
                line: 2,
                expected: 3,
                got: 2
            })
        );
        assert_eq!(
            parse_system("1 2 3\n", 10),
            Err(ValidationError::NotSquare { rows: 1, cols: 2 })
        );
        assert_eq!(
            parse_system("1 x\n", 10),
            Err(ValidationError::InvalidNumber {
                line: 1,
                token: "x".to_string()
            })
        );
        assert_eq!(parse_system("1 inf\n", 10), Err(ValidationError::NonFinite { line: 1 }));
        assert_eq!(
            parse_system("1 0 0\n0 1 0\n", 1),
            Err(ValidationError::TooLarge { n: 2, max_n: 1 })
        );
    }

    #[test]
    fn test_oversized_input_rejected_before_reading_rest() {
        // Wide first row: later garbage is never parsed
        assert_eq!(
            parse_system("1 0 0 0\nnot numbers at all\n", 2),
            Err(ValidationError::TooLarge { n: 3, max_n: 2 })
        );
        // Too many rows: stops at the first row past the limit
        assert_eq!(
            parse_system("1 0 0\n0 1 0\n0 0 1\nx y z\n", 2),
            Err(ValidationError::TooLarge { n: 3, max_n: 2 })
        );
        assert!(parse_system("1 0 0\n0 1 0\n", 2).is_ok());
    }

    #[test]
    fn test_text_round_trip_is_exact() {
        let system = LinearSystem {
            a: array![[0.1, 1.0 / 3.0], [-2.5e-300, 7.0]],
            b: array![std::f64::consts::PI, -0.0],
        };
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("input.txt");
        write_system(&path, &system).unwrap();
        assert_eq!(read_system(&path).unwrap(), system);
    }

    #[test]
    fn test_read_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        assert!(read_system(&temp.path().join("missing.txt")).is_err());
    }
}
