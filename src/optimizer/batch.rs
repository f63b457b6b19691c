//! Batch re-solve of the whole accumulated graph.
//!
//! Each call re-linearizes every factor from the current estimate and
//! iterates a damped Gauss-Newton (Levenberg-Marquardt) or Dogleg
//! trust-region step to convergence, bounded by a hard iteration cap. The
//! estimate is written back only when the attempt succeeds; a failed
//! attempt leaves the previous estimate untouched.

use std::ops::Mul;

use tracing::debug;

use crate::error::CalibError;
use crate::graph::{CalibrationGraph, Values};
use crate::linalg::{scale, DenseMatrix, SparseCholeskySolver, SparseLinearSolver, SparseMatrix};
use crate::optimizer::{
    apply_step, assemble, evaluate_cost, linearize_all, BatchStep, OptimizationStatus,
    OptimizeError, OptimizerConfig, Ordering, SolverResult,
};

/// Batch nonlinear solver (Levenberg-Marquardt or Dogleg).
pub struct BatchOptimizer {
    config: OptimizerConfig,
    solver: SparseCholeskySolver,
    damping: f64,
    damping_min: f64,
    damping_max: f64,
    damping_increase_factor: f64,
    damping_decrease_factor: f64,
    min_step_quality: f64,
    good_step_quality: f64,
    trust_region_radius: f64,
    trust_region_min: f64,
    trust_region_max: f64,
    trust_region_increase_factor: f64,
    trust_region_decrease_factor: f64,
}

impl BatchOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            solver: SparseCholeskySolver::new(),
            damping: 1e-6,
            damping_min: 1e-12,
            damping_max: 1e10,
            damping_increase_factor: 10.0,
            damping_decrease_factor: 0.3,
            min_step_quality: 0.0,
            good_step_quality: 0.75,
            trust_region_radius: 1.0,
            trust_region_min: 1e-12,
            trust_region_max: 1e12,
            trust_region_increase_factor: 2.0,
            trust_region_decrease_factor: 0.5,
        }
    }

    /// Set the initial damping parameter.
    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    /// Set the initial trust region radius.
    pub fn with_trust_region_radius(mut self, radius: f64) -> Self {
        self.trust_region_radius = radius;
        self
    }

    /// Update damping based on the gain ratio; returns whether the step is
    /// accepted.
    fn update_damping(&mut self, rho: f64) -> bool {
        if rho > self.good_step_quality {
            self.damping = (self.damping * self.damping_decrease_factor).max(self.damping_min);
            true
        } else if rho <= self.min_step_quality {
            self.damping = (self.damping * self.damping_increase_factor).min(self.damping_max);
            false
        } else {
            true
        }
    }

    /// Update the trust region radius based on the gain ratio.
    fn update_trust_region(&mut self, rho: f64, step_norm: f64) {
        if rho > 0.75 {
            self.trust_region_radius = (self.trust_region_radius
                * self.trust_region_increase_factor)
                .min(self.trust_region_max);
        } else if rho < 0.25 {
            self.trust_region_radius =
                (step_norm * self.trust_region_decrease_factor).max(self.trust_region_min);
        }
    }

    /// Dogleg step: Gauss-Newton inside the radius, scaled Cauchy point
    /// outside, quadratic blend on the boundary. Falls back to the clipped
    /// Cauchy step when the Gauss-Newton system is rank deficient.
    fn dogleg_step(
        &mut self,
        residual: &DenseMatrix,
        jacobian: &SparseMatrix,
    ) -> Option<DenseMatrix> {
        let gradient = jacobian.as_ref().transpose().mul(residual);
        let j_g = jacobian.as_ref().mul(&gradient);
        let g_norm_sq = gradient.norm_l2().powi(2);
        let j_g_norm_sq = j_g.norm_l2().powi(2);
        if j_g_norm_sq <= 0.0 {
            return None;
        }
        let alpha = g_norm_sq / j_g_norm_sq;
        let cauchy = scale(&gradient, -alpha);
        let cauchy_norm = cauchy.norm_l2();

        let gauss_newton = match self.solver.solve_normal_equation(residual, jacobian) {
            Some(step) => step,
            None => {
                debug!("Gauss-Newton system rank deficient, using Cauchy step");
                if cauchy_norm > self.trust_region_radius {
                    return Some(scale(&cauchy, self.trust_region_radius / cauchy_norm));
                }
                return Some(cauchy);
            }
        };
        if gauss_newton.norm_l2() <= self.trust_region_radius {
            return Some(gauss_newton);
        }

        if cauchy_norm >= self.trust_region_radius {
            return Some(scale(&cauchy, self.trust_region_radius / cauchy_norm));
        }

        // Blend: ‖p_c + β (p_gn − p_c)‖ = Δ.
        let diff = &gauss_newton - &cauchy;
        let a = diff.norm_l2().powi(2);
        let b = 2.0 * (cauchy.transpose() * &diff)[(0, 0)];
        let c = cauchy_norm.powi(2) - self.trust_region_radius.powi(2);
        let discriminant = b * b - 4.0 * a * c;
        if a <= 0.0 || discriminant < 0.0 {
            return Some(cauchy);
        }
        let beta = (-b + discriminant.sqrt()) / (2.0 * a);
        Some(&cauchy + &scale(&diff, beta))
    }

    /// Re-solve the accumulated graph from `current` as the initial guess.
    ///
    /// On success the result is written into `current`; on
    /// [`OptimizeError::NotConverged`] or [`OptimizeError::SingularSystem`]
    /// the previous `current` is retained unchanged.
    pub fn optimize(
        &mut self,
        graph: &CalibrationGraph,
        current: &mut Values,
    ) -> Result<SolverResult, CalibError> {
        let factors = graph.factors();
        let model = graph.kinematics();
        let camera = graph.camera();

        if factors.is_empty() {
            return Ok(SolverResult {
                status: OptimizationStatus::Converged,
                initial_cost: 0.0,
                final_cost: 0.0,
                iterations: 0,
                suppressed_factors: 0,
            });
        }

        let mut working = current.clone();
        let ordering = Ordering::from_values(&working);
        // The graph may have grown since the last call.
        self.solver.reset_pattern();

        let linearizations = linearize_all(factors, &working, model, camera)?;
        let mut suppressed = linearizations.iter().filter(|lin| lin.is_none()).count();
        let (mut jacobian, mut residual, mut cost) = assemble(&linearizations, &ordering)
            .ok_or(OptimizeError::SingularSystem)?;
        let initial_cost = cost;

        let mut status = None;
        let mut iteration = 0;
        while iteration < self.config.max_iterations {
            let gradient_norm = jacobian.as_ref().transpose().mul(&residual).norm_l2();
            if gradient_norm < self.config.gradient_tolerance {
                status = Some(OptimizationStatus::GradientToleranceReached);
                break;
            }

            let step = match self.config.batch_step {
                BatchStep::LevenbergMarquardt => {
                    self.solver
                        .solve_augmented_equation(&residual, &jacobian, self.damping)
                }
                BatchStep::DogLeg => self.dogleg_step(&residual, &jacobian),
            }
            .ok_or(OptimizeError::SingularSystem)?;
            let step_norm = step.norm_l2();
            if step_norm < self.config.parameter_tolerance {
                status = Some(OptimizationStatus::ParameterToleranceReached);
                break;
            }

            let mut candidate = working.clone();
            apply_step(&mut candidate, &ordering, &step)?;
            let new_cost = evaluate_cost(factors, &candidate, model, camera)?;

            // Predicted reduction from the linear model:
            // cost − ½‖r + J s‖².
            let j_step = jacobian.as_ref().mul(&step);
            let predicted_residual = &residual + &j_step;
            let predicted_reduction = cost - 0.5 * predicted_residual.norm_l2().powi(2);
            let actual_reduction = cost - new_cost;
            if predicted_reduction.abs() < 1e-15 && actual_reduction.abs() < 1e-15 {
                // Fixed point: the step changes nothing measurable.
                status = Some(OptimizationStatus::CostToleranceReached);
                break;
            }
            let rho = if predicted_reduction.abs() < 1e-15 {
                if actual_reduction > 0.0 {
                    1.0
                } else {
                    0.0
                }
            } else {
                actual_reduction / predicted_reduction
            };

            let accepted = match self.config.batch_step {
                BatchStep::LevenbergMarquardt => self.update_damping(rho),
                BatchStep::DogLeg => {
                    self.update_trust_region(rho, step_norm);
                    rho > 0.0
                }
            };

            iteration += 1;
            if accepted {
                debug!(
                    iteration,
                    cost = new_cost,
                    reduction = actual_reduction,
                    step_norm,
                    rho,
                    "step accepted"
                );
                working = candidate;
                let cost_change = actual_reduction;
                let previous_cost = cost;

                let relinearized = linearize_all(factors, &working, model, camera)?;
                suppressed = relinearized.iter().filter(|lin| lin.is_none()).count();
                let (j, r, c) = assemble(&relinearized, &ordering)
                    .ok_or(OptimizeError::SingularSystem)?;
                jacobian = j;
                residual = r;
                cost = c;

                if cost_change.abs() < self.config.cost_tolerance * previous_cost.max(1e-12) {
                    status = Some(OptimizationStatus::CostToleranceReached);
                    break;
                }
                if step_norm < self.config.parameter_tolerance {
                    status = Some(OptimizationStatus::ParameterToleranceReached);
                    break;
                }
            } else {
                debug!(iteration, cost, step_norm, rho, "step rejected");
            }
        }

        match status {
            Some(status) => {
                *current = working;
                Ok(SolverResult {
                    status,
                    initial_cost,
                    final_cost: cost,
                    iterations: iteration,
                    suppressed_factors: suppressed,
                })
            }
            None => Err(OptimizeError::NotConverged {
                iterations: iteration,
                cost,
            }
            .into()),
        }
    }
}
