//! Step-wise calibration engine.
//!
//! [`CalibrationEngine`] owns the factor graph, the optimizer, the three
//! estimates and the shared lock, and exposes the step-wise API the
//! driving loop consumes: `simulation_step`, `optimize_step`,
//! `compute_error`, the offset diagnostics and the per-variant render
//! snapshot.
//!
//! # Locking
//!
//! The engine state that an external visualization or reporting consumer
//! may read between steps (the estimates and the graph) lives behind a
//! single engine-owned mutex, handed out via [`CalibrationEngine::shared`].
//! Each mutating call (`simulation_step`, `optimize_step`) holds the lock
//! only for its own duration, never across a loop iteration.

use std::sync::{Arc, Mutex, MutexGuard};

use nalgebra as na;
use tracing::{info, warn};

use crate::camera::PinholeCamera;
use crate::error::{CalibError, CalibResult, ModelError};
use crate::evaluator::{self, CalibrationError};
use crate::graph::{
    CalibrationGraph, GraphConfig, Observation, StepRecord, VarKey, Values,
};
use crate::kinematics::KinematicModel;
use crate::optimizer::{
    BatchOptimizer, IncrementalOptimizer, OptimizationMode, OptimizeError, OptimizerConfig,
    SolverResult,
};
use crate::pose::Pose;
use crate::sim::{SimConfig, Simulator};

/// Which of the three parallel estimates a snapshot reflects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateKind {
    Initial,
    Current,
    GroundTruth,
}

/// RGBA tint the renderer applies to one estimate variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tint {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl EstimateKind {
    /// Default tints: initial cyan, current red, ground truth green.
    pub fn tint(self) -> Tint {
        match self {
            EstimateKind::Initial => Tint {
                r: 0.0,
                g: 0.8,
                b: 0.8,
                a: 1.0,
            },
            EstimateKind::Current => Tint {
                r: 0.8,
                g: 0.0,
                b: 0.0,
                a: 1.0,
            },
            EstimateKind::GroundTruth => Tint {
                r: 0.0,
                g: 0.8,
                b: 0.0,
                a: 1.0,
            },
        }
    }
}

/// What the renderer should draw for a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct DrawOptions {
    pub landmarks: bool,
    pub trajectory: bool,
    pub observations: bool,
    pub frustum: bool,
}

impl Default for DrawOptions {
    fn default() -> Self {
        Self {
            landmarks: true,
            trajectory: true,
            observations: false,
            frustum: false,
        }
    }
}

/// Read-only snapshot of one estimate variant for rendering.
#[derive(Debug, Clone)]
pub struct RenderSnapshot {
    pub kind: EstimateKind,
    pub tint: Tint,
    /// Camera pose per committed step, when trajectory drawing is on.
    pub trajectory: Vec<Pose>,
    /// Landmark positions, when landmark drawing is on.
    pub landmarks: Vec<(u64, na::Vector3<f64>)>,
    /// All pixel observations so far, when observation drawing is on.
    pub observations: Vec<Observation>,
    /// Camera frusta poses, when frustum drawing is on.
    pub frusta: Vec<Pose>,
}

/// State shared with the external visualization / reporting consumer.
pub struct SharedState {
    pub graph: CalibrationGraph,
    pub ground_truth: Values,
    pub initial: Values,
    pub current: Values,
    /// Per-step offset actually applied by the simulator (true − commanded).
    pub applied_offsets: Vec<na::DVector<f64>>,
    /// Optimization attempts that did not converge within budget.
    pub not_converged_count: usize,
    /// Optimization attempts aborted on a singular system.
    pub singular_count: usize,
}

/// Configuration surface of the engine.
#[derive(Debug, Clone)]
pub struct CalibrationParams {
    /// Drive the simulator path (the live-sensor path is out of scope).
    pub simulated: bool,
    pub optimization_mode: OptimizationMode,
    /// Expected step count of the run.
    pub trajectory_size: usize,
    pub optimizer: OptimizerConfig,
    pub graph: GraphConfig,
    pub sim: SimConfig,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            simulated: true,
            optimization_mode: OptimizationMode::Batch,
            trajectory_size: 50,
            optimizer: OptimizerConfig::default(),
            graph: GraphConfig::default(),
            sim: SimConfig::default(),
        }
    }
}

impl CalibrationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_simulated(mut self, simulated: bool) -> Self {
        self.simulated = simulated;
        self
    }

    pub fn with_optimization_mode(mut self, mode: OptimizationMode) -> Self {
        self.optimization_mode = mode;
        self
    }

    pub fn with_trajectory_size(mut self, trajectory_size: usize) -> Self {
        self.trajectory_size = trajectory_size;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_graph(mut self, graph: GraphConfig) -> Self {
        self.graph = graph;
        self
    }

    pub fn with_sim(mut self, sim: SimConfig) -> Self {
        self.sim = sim;
        self
    }
}

enum EngineOptimizer {
    Batch(BatchOptimizer),
    Incremental(IncrementalOptimizer),
}

/// Owns the calibration state and drives it one step at a time.
pub struct CalibrationEngine {
    params: CalibrationParams,
    simulator: Option<Simulator>,
    optimizer: EngineOptimizer,
    shared: Arc<Mutex<SharedState>>,
}

impl CalibrationEngine {
    /// Build an engine on the simulated path from pre-parsed trajectory
    /// rows.
    pub fn new_simulated(
        mut params: CalibrationParams,
        kinematics: KinematicModel,
        camera: PinholeCamera,
        rows: Vec<na::DVector<f64>>,
    ) -> CalibResult<Self> {
        params.simulated = true;
        params.sim.trajectory_size = params.trajectory_size;
        let simulator = Simulator::from_rows(
            params.sim.clone(),
            kinematics.clone(),
            camera.clone(),
            params.graph.extrinsic_nominal.clone(),
            rows,
        )?;
        Ok(Self::assemble(params, kinematics, camera, Some(simulator)))
    }

    /// Build an engine that is fed externally via [`Self::feed_step`]
    /// (live-sensor drivers).
    pub fn new(
        mut params: CalibrationParams,
        kinematics: KinematicModel,
        camera: PinholeCamera,
    ) -> Self {
        params.simulated = false;
        Self::assemble(params, kinematics, camera, None)
    }

    fn assemble(
        params: CalibrationParams,
        kinematics: KinematicModel,
        camera: PinholeCamera,
        simulator: Option<Simulator>,
    ) -> Self {
        let optimizer = match params.optimization_mode {
            OptimizationMode::Batch => {
                EngineOptimizer::Batch(BatchOptimizer::new(params.optimizer.clone()))
            }
            OptimizationMode::Incremental => {
                EngineOptimizer::Incremental(IncrementalOptimizer::new(params.optimizer.clone()))
            }
        };
        let graph = CalibrationGraph::new(params.graph.clone(), kinematics, camera);
        let shared = Arc::new(Mutex::new(SharedState {
            graph,
            ground_truth: Values::new(),
            initial: Values::new(),
            current: Values::new(),
            applied_offsets: Vec::new(),
            not_converged_count: 0,
            singular_count: 0,
        }));
        Self {
            params,
            simulator,
            optimizer,
            shared,
        }
    }

    pub fn params(&self) -> &CalibrationParams {
        &self.params
    }

    /// Handle to the state shared with the external consumer.
    pub fn shared(&self) -> Arc<Mutex<SharedState>> {
        Arc::clone(&self.shared)
    }

    pub fn simulator(&self) -> Option<&Simulator> {
        self.simulator.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        // A consumer that panicked while reading cannot corrupt the state
        // it never mutates; recover the guard.
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generate step `index` with the simulator and commit it to the
    /// graph. Holds the shared lock only while mutating.
    pub fn simulation_step(&mut self, index: usize) -> CalibResult<()> {
        let simulator = self
            .simulator
            .as_mut()
            .ok_or(ModelError::SimulationDisabled)?;
        let data = simulator.step(index)?;

        let record = StepRecord {
            commanded: data.commanded.clone(),
            measured: data.measured.clone(),
            observations: data.observations.clone(),
        };

        let mut guard = self
            .shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let shared = &mut *guard;
        simulator.record_ground_truth(&data, &mut shared.ground_truth);
        shared.applied_offsets.push(data.applied_offset());
        shared
            .graph
            .add_step(index, record, &mut shared.initial, &mut shared.current)?;
        Ok(())
    }

    /// Commit an externally observed step (live-sensor path).
    pub fn feed_step(&mut self, index: usize, record: StepRecord) -> CalibResult<()> {
        let mut guard = self.lock();
        let shared = &mut *guard;
        shared
            .graph
            .add_step(index, record, &mut shared.initial, &mut shared.current)?;
        Ok(())
    }

    /// Run one optimization attempt over the accumulated graph.
    ///
    /// On failure the previous current estimate is retained; the failure
    /// is counted and logged, and the engine stays usable for the next
    /// step.
    pub fn optimize_step(&mut self) -> CalibResult<SolverResult> {
        let mut guard = self
            .shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let shared = &mut *guard;

        let outcome = match &mut self.optimizer {
            EngineOptimizer::Batch(optimizer) => {
                optimizer.optimize(&shared.graph, &mut shared.current)
            }
            EngineOptimizer::Incremental(optimizer) => {
                optimizer.update(&shared.graph, &mut shared.current)
            }
        };

        match &outcome {
            Ok(result) => {
                info!(
                    status = %result.status,
                    final_cost = result.final_cost,
                    iterations = result.iterations,
                    "optimization step finished"
                );
            }
            Err(CalibError::Optimize(OptimizeError::NotConverged { iterations, cost })) => {
                shared.not_converged_count += 1;
                warn!(
                    iterations,
                    cost, "optimization did not converge, estimate retained"
                );
            }
            Err(CalibError::Optimize(OptimizeError::SingularSystem)) => {
                shared.singular_count += 1;
                warn!("singular system, estimate retained");
            }
            Err(_) => {}
        }
        outcome
    }

    /// Aggregate error of the current estimate against ground truth.
    pub fn compute_error(&self) -> CalibrationError {
        let guard = self.lock();
        evaluator::compute_error(&guard.ground_truth, &guard.current)
    }

    /// Estimated-vs-ground-truth offset difference, one entry per joint.
    pub fn joint_offset_error(&self) -> na::DVector<f64> {
        let guard = self.lock();
        let dof = guard.graph.kinematics().dof();
        evaluator::joint_offset_error(&guard.ground_truth, &guard.current, dof)
    }

    /// Current-vs-initial offset difference (diagnostic projection).
    pub fn joint_offset_progress(&self) -> na::DVector<f64> {
        let guard = self.lock();
        let dof = guard.graph.kinematics().dof();
        evaluator::joint_offset_progress(&guard.current, &guard.initial, dof)
    }

    /// Simulated-vs-true offset difference at one step (diagnostic
    /// projection).
    pub fn sim_offset_deviation(&self, step: usize) -> CalibResult<na::DVector<f64>> {
        let guard = self.lock();
        let applied =
            guard
                .applied_offsets
                .get(step)
                .ok_or(ModelError::StepOutOfRange {
                    index: step,
                    len: guard.applied_offsets.len(),
                })?;
        Ok(evaluator::sim_offset_deviation(&guard.ground_truth, applied))
    }

    /// One diagnostic line per step: the estimated-vs-ground-truth offset
    /// error fields followed by the simulated-vs-true offset fields.
    pub fn joint_offset_record(&self, step: usize) -> CalibResult<String> {
        let error = self.joint_offset_error();
        let deviation = self.sim_offset_deviation(step)?;
        let fields: Vec<String> = error
            .iter()
            .chain(deviation.iter())
            .map(|value| format!("{value}"))
            .collect();
        Ok(fields.join(" "))
    }

    /// 14-field extrinsic line: ground-truth translation and quaternion
    /// (x, y, z, w) followed by the estimated ones.
    pub fn extrinsic_record(&self) -> String {
        let guard = self.lock();
        let mut fields = Vec::with_capacity(14);
        for values in [&guard.ground_truth, &guard.current] {
            match values.pose(&VarKey::Extrinsic) {
                Ok(pose) => {
                    let t = pose.translation();
                    let q = pose.rotation();
                    fields.extend([
                        format!("{}", t.x),
                        format!("{}", t.y),
                        format!("{}", t.z),
                        format!("{}", q.i),
                        format!("{}", q.j),
                        format!("{}", q.k),
                        format!("{}", q.w),
                    ]);
                }
                Err(_) => fields.extend(std::iter::repeat("0".to_string()).take(7)),
            }
        }
        fields.join(" ")
    }

    /// 3-field aggregate error line: landmark, extrinsic, joint-angle.
    pub fn error_record(&self) -> String {
        let error = self.compute_error();
        format!(
            "{} {} {}",
            error.landmark_error, error.extrinsic_error, error.joint_angle_error
        )
    }

    /// Read-only snapshot of one estimate variant for rendering.
    pub fn render_snapshot(
        &self,
        kind: EstimateKind,
        options: DrawOptions,
    ) -> CalibResult<RenderSnapshot> {
        let guard = self.lock();
        let values = match kind {
            EstimateKind::Initial => &guard.initial,
            EstimateKind::Current => &guard.current,
            EstimateKind::GroundTruth => &guard.ground_truth,
        };

        let mut trajectory = Vec::new();
        if options.trajectory || options.frustum {
            let kinematics = guard.graph.kinematics();
            for index in 0..guard.graph.steps_added() {
                let record = match guard.graph.step(index) {
                    Some(record) => record,
                    None => continue,
                };
                let theta = match kind {
                    // The ground truth replays the exact applied offsets.
                    EstimateKind::GroundTruth => match guard.applied_offsets.get(index) {
                        Some(applied) => &record.commanded + applied,
                        None => record.commanded.clone(),
                    },
                    _ => match values.vector(&VarKey::JointOffset) {
                        Ok(offset) => &record.commanded + offset,
                        Err(_) => record.commanded.clone(),
                    },
                };
                let fk = kinematics.forward(&theta)?;
                let base = values.pose(&VarKey::Pose(index)).cloned().unwrap_or_default();
                let extrinsic = values
                    .pose(&VarKey::Extrinsic)
                    .cloned()
                    .unwrap_or_default();
                trajectory.push(base.compose(&fk).compose(&extrinsic));
            }
        }

        let mut landmarks = Vec::new();
        if options.landmarks {
            for key in values.keys() {
                if let VarKey::Landmark(id) = key {
                    if let Ok(position) = values.point(key) {
                        landmarks.push((*id, *position));
                    }
                }
            }
            landmarks.sort_by_key(|(id, _)| *id);
        }

        let mut observations = Vec::new();
        if options.observations {
            for index in 0..guard.graph.steps_added() {
                if let Some(record) = guard.graph.step(index) {
                    observations.extend(record.observations.iter().cloned());
                }
            }
        }

        let frusta = if options.frustum {
            trajectory.clone()
        } else {
            Vec::new()
        };
        if !options.trajectory {
            trajectory.clear();
        }

        Ok(RenderSnapshot {
            kind,
            tint: kind.tint(),
            trajectory,
            landmarks,
            observations,
            frusta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::NoiseModel;

    fn zero_noise_params(steps: usize) -> CalibrationParams {
        CalibrationParams::default()
            .with_trajectory_size(steps)
            .with_sim(SimConfig {
                trajectory_size: steps,
                landmark_count: 6,
                joint_perturbation: NoiseModel::zero(),
                pixel_noise: NoiseModel::zero(),
                offset_noise: NoiseModel::zero(),
                ..SimConfig::default()
            })
    }

    fn build_engine(steps: usize) -> CalibrationEngine {
        let kinematics = KinematicModel::default_6dof();
        let camera = PinholeCamera::new(520.0, 520.0, 320.0, 240.0).with_bounds(640.0, 480.0);
        let rows = vec![na::DVector::zeros(6); steps];
        CalibrationEngine::new_simulated(zero_noise_params(steps), kinematics, camera, rows)
            .unwrap()
    }

    #[test]
    fn test_simulation_step_commits_to_graph() {
        let mut engine = build_engine(3);
        engine.simulation_step(0).unwrap();
        engine.simulation_step(1).unwrap();

        let shared = engine.shared();
        let guard = shared.lock().unwrap();
        assert_eq!(guard.graph.steps_added(), 2);
        assert_eq!(guard.graph.stats().encoder_factors, 2);
        assert!(guard.current.vector(&VarKey::JointOffset).is_ok());
    }

    #[test]
    fn test_out_of_order_simulation_step_fails() {
        let mut engine = build_engine(3);
        engine.simulation_step(0).unwrap();
        let err = engine.simulation_step(2).unwrap_err();
        assert!(matches!(err, CalibError::Graph(_)));
    }

    #[test]
    fn test_records_have_expected_field_counts() {
        let mut engine = build_engine(3);
        engine.simulation_step(0).unwrap();

        let offsets = engine.joint_offset_record(0).unwrap();
        assert_eq!(offsets.split_whitespace().count(), 12);

        let extrinsic = engine.extrinsic_record();
        assert_eq!(extrinsic.split_whitespace().count(), 14);

        let error = engine.error_record();
        assert_eq!(error.split_whitespace().count(), 3);
    }

    #[test]
    fn test_render_snapshot_variants() {
        let mut engine = build_engine(3);
        engine.simulation_step(0).unwrap();
        engine.simulation_step(1).unwrap();

        let options = DrawOptions {
            landmarks: true,
            trajectory: true,
            observations: true,
            frustum: true,
        };
        for kind in [
            EstimateKind::Initial,
            EstimateKind::Current,
            EstimateKind::GroundTruth,
        ] {
            let snapshot = engine.render_snapshot(kind, options).unwrap();
            assert_eq!(snapshot.kind, kind);
            assert_eq!(snapshot.trajectory.len(), 2);
            assert_eq!(snapshot.frusta.len(), 2);
            assert!(!snapshot.landmarks.is_empty());
            assert!(!snapshot.observations.is_empty());
        }

        let current_tint = EstimateKind::Current.tint();
        assert!((current_tint.r - 0.8).abs() < 1e-6);
        assert_eq!(current_tint.a, 1.0);
    }

    #[test]
    fn test_simulation_disabled_on_live_path() {
        let kinematics = KinematicModel::default_6dof();
        let camera = PinholeCamera::new(520.0, 520.0, 320.0, 240.0);
        let mut engine =
            CalibrationEngine::new(CalibrationParams::default(), kinematics, camera);
        let err = engine.simulation_step(0).unwrap_err();
        assert!(matches!(
            err,
            CalibError::Model(ModelError::SimulationDisabled)
        ));
    }
}
