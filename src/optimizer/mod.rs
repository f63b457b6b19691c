//! Optimization strategies over the calibration graph.
//!
//! Two strategies are selectable at configuration time: a batch re-solve of
//! the whole accumulated graph (Levenberg-Marquardt or Dogleg, see
//! [`batch`]) and a filtering-style incremental update that re-linearizes
//! only new factors (see [`incremental`]).

pub mod batch;
pub mod incremental;

use std::collections::HashMap;
use std::fmt;

use faer_ext::IntoFaer;
use nalgebra as na;
use rayon::prelude::*;
use thiserror::Error;

pub use batch::BatchOptimizer;
pub use incremental::IncrementalOptimizer;

use crate::camera::PinholeCamera;
use crate::error::ModelError;
use crate::graph::{Factor, Linearization, VarKey, Values};
use crate::kinematics::KinematicModel;
use crate::linalg::{DenseMatrix, SparseMatrix};

/// Optimization failure. Both variants are recoverable at the call level:
/// the previous estimate is retained and the caller may retry on the next
/// step once more data has arrived.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizeError {
    /// The iteration budget ran out before the stopping criterion held.
    #[error("did not converge within {iterations} iterations (cost {cost:.6e})")]
    NotConverged { iterations: usize, cost: f64 },

    /// The linear system was not positive definite: insufficient
    /// constraints, e.g. an under-observed landmark or a missing prior.
    #[error("singular system: insufficient constraints for a unique update")]
    SingularSystem,
}

/// Strategy selected in the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationMode {
    /// Filtering-style incremental solve, O(new work) per step.
    Incremental,
    /// Full re-linearization of the accumulated graph each call.
    #[default]
    Batch,
}

/// Step computation used by the batch optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchStep {
    /// Damped Gauss-Newton with adaptive damping.
    #[default]
    LevenbergMarquardt,
    /// Trust-region blend of the Gauss-Newton and Cauchy steps.
    DogLeg,
}

impl fmt::Display for BatchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStep::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
            BatchStep::DogLeg => write!(f, "Dog Leg"),
        }
    }
}

/// Solver configuration shared by both strategies.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Hard iteration cap of a batch solve.
    pub max_iterations: usize,
    /// Relative cost-decrease stopping criterion.
    pub cost_tolerance: f64,
    /// Step-norm stopping criterion.
    pub parameter_tolerance: f64,
    /// Gradient-norm stopping criterion.
    pub gradient_tolerance: f64,
    /// Batch step computation.
    pub batch_step: BatchStep,
    /// Incremental mode: re-linearize everything once any variable has
    /// drifted this far (tangent norm) from its linearization point.
    pub relinearize_threshold: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            cost_tolerance: 1e-9,
            parameter_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
            batch_step: BatchStep::default(),
            relinearize_threshold: 0.1,
        }
    }
}

impl OptimizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    pub fn with_batch_step(mut self, batch_step: BatchStep) -> Self {
        self.batch_step = batch_step;
        self
    }

    pub fn with_relinearize_threshold(mut self, threshold: f64) -> Self {
        self.relinearize_threshold = threshold;
        self
    }
}

/// Status of a completed optimization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    Converged,
    CostToleranceReached,
    ParameterToleranceReached,
    GradientToleranceReached,
    MaxIterationsReached,
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::CostToleranceReached => write!(f, "Cost tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
        }
    }
}

/// Result of a successful optimization attempt.
#[derive(Debug, Clone)]
pub struct SolverResult {
    pub status: OptimizationStatus,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    /// Projection factors skipped because their landmark was not visible
    /// at the linearization point.
    pub suppressed_factors: usize,
}

/// Deterministic column ordering of the free variables.
pub(crate) struct Ordering {
    pub keys: Vec<VarKey>,
    pub offsets: HashMap<VarKey, usize>,
    pub total_dof: usize,
}

impl Ordering {
    /// Order every variable present in `values`, sorted by key for
    /// reproducibility.
    pub fn from_values(values: &Values) -> Self {
        let mut keys: Vec<VarKey> = values.keys().copied().collect();
        keys.sort();

        let mut offsets = HashMap::with_capacity(keys.len());
        let mut total_dof = 0;
        for key in &keys {
            let dof = values
                .get(key)
                .map(|value| value.dof())
                .unwrap_or_default();
            offsets.insert(*key, total_dof);
            total_dof += dof;
        }

        Self {
            keys,
            offsets,
            total_dof,
        }
    }
}

/// Linearize every factor at `values` in parallel.
///
/// Returns one entry per factor; `None` marks a suppressed projection
/// factor (landmark invisible at the linearization point).
pub(crate) fn linearize_all(
    factors: &[Factor],
    values: &Values,
    model: &KinematicModel,
    camera: &PinholeCamera,
) -> Result<Vec<Option<Linearization>>, ModelError> {
    factors
        .par_iter()
        .map(|factor| factor.linearize(values, model, camera))
        .collect()
}

/// Stack cached linearizations into the global sparse system.
///
/// Returns the Jacobian, the residual vector, and the cost
/// `0.5 · ‖r‖²` at the linearization point.
pub(crate) fn assemble(
    linearizations: &[Option<Linearization>],
    ordering: &Ordering,
) -> Option<(SparseMatrix, DenseMatrix, f64)> {
    let total_rows: usize = linearizations
        .iter()
        .flatten()
        .map(|lin| lin.residual.len())
        .sum();

    let mut residual = na::DVector::<f64>::zeros(total_rows);
    let mut triplets = Vec::new();
    let mut row = 0;
    for lin in linearizations.iter().flatten() {
        let rows = lin.residual.len();
        residual.rows_mut(row, rows).copy_from(&lin.residual);

        for (key, jacobian) in lin.keys.iter().zip(lin.jacobians.iter()) {
            let col_offset = *ordering.offsets.get(key)?;
            for c in 0..jacobian.ncols() {
                for r in 0..rows {
                    let value = jacobian[(r, c)];
                    if value.abs() > 1e-15 {
                        triplets.push(faer::sparse::Triplet::new(row + r, col_offset + c, value));
                    }
                }
            }
        }
        row += rows;
    }

    let cost = 0.5 * residual.norm_squared();
    let jacobian = crate::linalg::triplets_to_sparse(total_rows, ordering.total_dof, &triplets)?;
    let residual = residual.view_range(.., ..).into_faer().to_owned();
    Some((jacobian, residual, cost))
}

/// Evaluate the cost at `values` without building the Jacobian.
pub(crate) fn evaluate_cost(
    factors: &[Factor],
    values: &Values,
    model: &KinematicModel,
    camera: &PinholeCamera,
) -> Result<f64, ModelError> {
    let linearizations = linearize_all(factors, values, model, camera)?;
    Ok(linearizations
        .iter()
        .flatten()
        .map(|lin| 0.5 * lin.residual.norm_squared())
        .sum())
}

/// Retract every variable by its slice of the global step vector.
pub(crate) fn apply_step(
    values: &mut Values,
    ordering: &Ordering,
    step: &DenseMatrix,
) -> Result<(), ModelError> {
    for key in &ordering.keys {
        let dof = values
            .get(key)
            .map(|value| value.dof())
            .unwrap_or_default();
        let offset = ordering.offsets[key];
        let mut delta = na::DVector::zeros(dof);
        for i in 0..dof {
            delta[i] = step[(offset + i, 0)];
        }
        values.apply_delta(key, delta.as_view())?;
    }
    Ok(())
}
