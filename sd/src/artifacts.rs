//! On-disk artifacts: validated inputs, solutions, factors
//!
//! Layout: `<root>/<task_id>/{input.txt, solution.txt, L.txt, U.txt, P.txt}`.
//! Numbers are written with `{:.17e}` so they read back bit-exact.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use ndarray::{Array1, Array2};
use tracing::debug;

use crate::domain::FactorArtifacts;
use crate::engine::{LinearSystem, LuFactors, write_system};

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_dir(&self, task_id: &str) -> Result<PathBuf> {
        let dir = self.root.join(task_id);
        std::fs::create_dir_all(&dir).context(format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Store a validated input system
    pub fn write_input(&self, task_id: &str, system: &LinearSystem) -> Result<PathBuf> {
        debug!(%task_id, n = system.n(), "write_input: called");
        let path = self.task_dir(task_id)?.join("input.txt");
        write_system(&path, system)?;
        Ok(path)
    }

    /// Store the solution vector, one value per line
    pub fn write_solution(&self, task_id: &str, x: &Array1<f64>) -> Result<PathBuf> {
        debug!(%task_id, n = x.len(), "write_solution: called");
        let path = self.task_dir(task_id)?.join("solution.txt");
        let mut out = String::new();
        for value in x.iter() {
            let _ = writeln!(out, "{:.17e}", value);
        }
        std::fs::write(&path, out).context(format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Store L, U and the permutation matrix P
    pub fn write_factors(&self, task_id: &str, factors: &LuFactors) -> Result<FactorArtifacts> {
        debug!(%task_id, n = factors.n(), "write_factors: called");
        let dir = self.task_dir(task_id)?;
        let l = dir.join("L.txt");
        let u = dir.join("U.txt");
        let p = dir.join("P.txt");
        write_matrix(&l, &factors.l)?;
        write_matrix(&u, &factors.u)?;
        write_matrix(&p, &factors.p())?;
        Ok(FactorArtifacts {
            l: l.to_string_lossy().into_owned(),
            u: u.to_string_lossy().into_owned(),
            p: p.to_string_lossy().into_owned(),
        })
    }

    /// Read a solution vector written by [`write_solution`](Self::write_solution)
    pub fn read_solution(path: &Path) -> Result<Vec<f64>> {
        let text = std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
        text.split_whitespace()
            .map(|token| {
                token
                    .parse::<f64>()
                    .context(format!("Invalid value '{}' in {}", token, path.display()))
            })
            .collect()
    }
}

fn write_matrix(path: &Path, matrix: &Array2<f64>) -> Result<()> {
    let mut out = String::new();
    for row in matrix.rows() {
        let line: Vec<String> = row.iter().map(|v| format!("{:.17e}", v)).collect();
        let _ = writeln!(out, "{}", line.join(" "));
    }
    std::fs::write(path, out).context(format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    #[test]
    fn test_solution_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        let x = array![0.8, 1.4, 1.0 / 3.0];

        let path = store.write_solution("t1", &x).unwrap();
        assert!(path.starts_with(temp.path().join("t1")));
        assert_eq!(ArtifactStore::read_solution(&path).unwrap(), x.to_vec());
    }

    #[test]
    fn test_factor_files() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        let factors = LuFactors {
            l: array![[1.0, 0.0], [0.5, 1.0]],
            u: array![[2.0, 1.0], [0.0, 2.5]],
            perm: vec![1, 0],
        };

        let paths = store.write_factors("t2", &factors).unwrap();
        let p = std::fs::read_to_string(&paths.p).unwrap();
        let rows: Vec<&str> = p.lines().collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("0.0"));
        assert!(Path::new(&paths.l).exists());
        assert!(Path::new(&paths.u).exists());
    }
}
