//! Trajectory resource loading.
//!
//! A trajectory is an ordered sequence of rows, each row a
//! whitespace-separated joint vector of fixed arity. Malformed or short
//! rows are a fatal load error; the simulator never retries or recovers
//! from a bad resource.

use std::path::Path;

use nalgebra as na;
use thiserror::Error;

/// Malformed trajectory or configuration resource. Fatal at startup.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read trajectory resource: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: failed to parse '{token}' as a joint angle")]
    MalformedRow { line: usize, token: String },

    #[error("line {line}: row has {actual} entries, expected {expected}")]
    ArityMismatch {
        line: usize,
        expected: usize,
        actual: usize,
    },

    #[error("trajectory has {actual} steps, configuration expects {expected}")]
    TrajectorySize { expected: usize, actual: usize },
}

/// Parse trajectory rows from text. Blank lines are skipped; every
/// non-blank row must hold exactly `dof` angles.
pub fn parse(text: &str, dof: usize) -> Result<Vec<na::DVector<f64>>, LoadError> {
    let mut rows = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut angles = Vec::with_capacity(dof);
        for token in trimmed.split_whitespace() {
            let angle = token.parse::<f64>().map_err(|_| LoadError::MalformedRow {
                line: index + 1,
                token: token.to_string(),
            })?;
            angles.push(angle);
        }

        if angles.len() != dof {
            return Err(LoadError::ArityMismatch {
                line: index + 1,
                expected: dof,
                actual: angles.len(),
            });
        }
        rows.push(na::DVector::from_vec(angles));
    }
    Ok(rows)
}

/// Load and parse a trajectory file.
pub fn load(path: &Path, dof: usize) -> Result<Vec<na::DVector<f64>>, LoadError> {
    let text = std::fs::read_to_string(path)?;
    parse(&text, dof)
}
