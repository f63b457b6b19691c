//! Error types for the arm-calib library.
//!
//! Each concern raises its own error enum; [`CalibError`] aggregates them
//! for callers that drive the whole pipeline. All errors use the
//! `thiserror` crate for automatic trait implementations.

use thiserror::Error;

use crate::camera::ProjectionError;
use crate::graph::GraphError;
use crate::optimizer::OptimizeError;
use crate::sim::trajectory::LoadError;

/// Main result type used throughout the arm-calib library.
pub type CalibResult<T> = Result<T, CalibError>;

/// Malformed model input: programmer errors that validated configuration
/// should never produce.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Joint vector arity does not match the configured chain.
    #[error("joint vector has {actual} entries, model expects {expected}")]
    DofMismatch { expected: usize, actual: usize },

    /// A typed accessor was asked for a different category than the
    /// variable holds.
    #[error("variable {key} holds a different category than requested")]
    KeyMismatch { key: String },

    /// A variable required for evaluation is absent from the estimate.
    #[error("variable {key} is not present in the estimate")]
    MissingVariable { key: String },

    /// A step index outside the configured trajectory was requested.
    #[error("step {index} is outside the trajectory of {len} steps")]
    StepOutOfRange { index: usize, len: usize },

    /// A simulation step was requested on the live-sensor path.
    #[error("simulation step requested but the simulated path is disabled")]
    SimulationDisabled,
}

/// Top-level error for the arm-calib library.
#[derive(Debug, Error)]
pub enum CalibError {
    /// Malformed kinematic input or variable-store misuse (fatal).
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Point not visible (expected, recoverable; suppresses one factor).
    #[error("projection error: {0}")]
    Projection(#[from] ProjectionError),

    /// Step protocol violation (fatal, indicates a driver bug).
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Optimization did not converge or the system was singular
    /// (recoverable; the previous estimate is retained).
    #[error("optimization error: {0}")]
    Optimize(#[from] OptimizeError),

    /// Malformed trajectory or configuration resource (fatal at startup).
    #[error("load error: {0}")]
    Load(#[from] LoadError),
}

impl From<std::io::Error> for CalibError {
    fn from(err: std::io::Error) -> Self {
        CalibError::Load(LoadError::Io(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_error_display() {
        let error = ModelError::DofMismatch {
            expected: 6,
            actual: 4,
        };
        assert_eq!(
            error.to_string(),
            "joint vector has 4 entries, model expects 6"
        );
    }

    #[test]
    fn test_calib_error_from_model() {
        let error: CalibError = ModelError::MissingVariable {
            key: "pose(3)".to_string(),
        }
        .into();
        match error {
            CalibError::Model(ModelError::MissingVariable { key }) => {
                assert_eq!(key, "pose(3)");
            }
            other => panic!("expected model error, got {other:?}"),
        }
    }

    #[test]
    fn test_calib_result_ok() {
        let result: CalibResult<i32> = Ok(42);
        assert!(result.is_ok());
    }
}
