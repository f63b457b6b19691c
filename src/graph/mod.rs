//! Append-only calibration factor graph.
//!
//! The graph accumulates variables and factors one simulation step at a
//! time. Factors are never removed or edited after creation; the
//! incremental optimizer relies on this monotonic growth to reuse prior
//! linearizations.

pub mod factor;
pub mod values;

use nalgebra as na;
use thiserror::Error;
use tracing::debug;

pub use factor::{EncoderFactor, Factor, Linearization, PriorFactor, ProjectionFactor};
pub use values::{VarKey, VarValue, Values};

use crate::camera::PinholeCamera;
use crate::error::ModelError;
use crate::kinematics::KinematicModel;
use crate::pose::Pose;

/// Step protocol violation: indicates a driver bug. The graph is left
/// unchanged when this is raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("step {actual} added out of order, expected step {expected}")]
    StepOutOfOrder { expected: usize, actual: usize },

    #[error("variable {key} created twice")]
    DuplicateVariable { key: String },
}

/// A pixel observation of one landmark at one step. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub step: usize,
    pub landmark: u64,
    pub pixel: na::Vector2<f64>,
}

/// Everything the graph needs from one simulation step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub commanded: na::DVector<f64>,
    pub measured: na::DVector<f64>,
    pub observations: Vec<Observation>,
}

/// Counters for conditions the graph suppressed or created; exposed so
/// tests and logs can observe them.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphStats {
    pub landmarks_created: usize,
    pub encoder_factors: usize,
    pub projection_factors: usize,
    pub prior_factors: usize,
}

/// Noise and seeding configuration of the graph.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Sigma of the encoder pseudo-measurement (radians).
    pub encoder_sigma: f64,
    /// Sigma of the pixel measurement (pixels).
    pub pixel_sigma: f64,
    /// Sigma of the first-pose anchor.
    pub pose_prior_sigma: f64,
    /// Sigma of the (deliberately loose) extrinsic anchor.
    pub extrinsic_prior_sigma: f64,
    /// Depth at which unseen landmarks are seeded along the viewing ray.
    pub assumed_depth: f64,
    /// Nominal extrinsic used as the step-0 seed and anchor.
    pub extrinsic_nominal: Pose,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            encoder_sigma: 0.02,
            pixel_sigma: 1.0,
            pose_prior_sigma: 1e-4,
            extrinsic_prior_sigma: 10.0,
            assumed_depth: 1.5,
            extrinsic_nominal: Pose::identity(),
        }
    }
}

/// The accumulating factor graph and its step bookkeeping.
pub struct CalibrationGraph {
    config: GraphConfig,
    kinematics: KinematicModel,
    camera: PinholeCamera,
    factors: Vec<Factor>,
    steps: Vec<StepRecord>,
    stats: GraphStats,
}

impl CalibrationGraph {
    pub fn new(config: GraphConfig, kinematics: KinematicModel, camera: PinholeCamera) -> Self {
        Self {
            config,
            kinematics,
            camera,
            factors: Vec::new(),
            steps: Vec::new(),
            stats: GraphStats::default(),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn kinematics(&self) -> &KinematicModel {
        &self.kinematics
    }

    pub fn camera(&self) -> &PinholeCamera {
        &self.camera
    }

    /// Number of steps committed so far.
    pub fn steps_added(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, index: usize) -> Option<&StepRecord> {
        self.steps.get(index)
    }

    /// The append-only factor slice.
    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    pub fn stats(&self) -> GraphStats {
        self.stats
    }

    fn add_variable(
        values: &mut Values,
        key: VarKey,
        value: VarValue,
    ) -> Result<(), GraphError> {
        if values.contains(&key) {
            return Err(GraphError::DuplicateVariable {
                key: key.to_string(),
            });
        }
        values.insert(key, value);
        Ok(())
    }

    /// Commit one step's variables and factors.
    ///
    /// Seeds new variables into both `initial` (frozen per step once
    /// written) and `current`, then appends the step's factors. Steps must
    /// arrive strictly in order; a duplicate or out-of-order index is
    /// rejected with [`GraphError::StepOutOfOrder`] and the graph stays
    /// unchanged.
    pub fn add_step(
        &mut self,
        index: usize,
        record: StepRecord,
        initial: &mut Values,
        current: &mut Values,
    ) -> Result<(), crate::error::CalibError> {
        if index != self.steps.len() {
            return Err(GraphError::StepOutOfOrder {
                expected: self.steps.len(),
                actual: index,
            }
            .into());
        }

        let dof = self.kinematics.dof();
        if record.commanded.len() != dof {
            return Err(ModelError::DofMismatch {
                expected: dof,
                actual: record.commanded.len(),
            }
            .into());
        }

        if index == 0 {
            // Global unknowns plus the gauge anchors.
            Self::add_variable(
                current,
                VarKey::JointOffset,
                VarValue::Vector(na::DVector::zeros(dof)),
            )?;
            Self::add_variable(
                current,
                VarKey::Extrinsic,
                VarValue::Pose(self.config.extrinsic_nominal.clone()),
            )?;
            initial.insert(
                VarKey::JointOffset,
                VarValue::Vector(na::DVector::zeros(dof)),
            );
            initial.insert(
                VarKey::Extrinsic,
                VarValue::Pose(self.config.extrinsic_nominal.clone()),
            );

            self.factors.push(Factor::Prior(PriorFactor {
                key: VarKey::Extrinsic,
                pose: self.config.extrinsic_nominal.clone(),
                sigma: self.config.extrinsic_prior_sigma,
            }));
            self.stats.prior_factors += 1;
        }

        // Per-step pose, seeded from the previous step's estimate
        // propagated by (identity) odometry, or anchored at step 0.
        let pose_seed = if index == 0 {
            Pose::identity()
        } else {
            current.pose(&VarKey::Pose(index - 1))?.clone()
        };
        Self::add_variable(current, VarKey::Pose(index), VarValue::Pose(pose_seed.clone()))?;
        initial.insert(VarKey::Pose(index), VarValue::Pose(pose_seed.clone()));

        if index == 0 {
            self.factors.push(Factor::Prior(PriorFactor {
                key: VarKey::Pose(0),
                pose: pose_seed.clone(),
                sigma: self.config.pose_prior_sigma,
            }));
            self.stats.prior_factors += 1;
        }

        self.factors.push(Factor::Encoder(EncoderFactor {
            step: index,
            commanded: record.commanded.clone(),
            measured: record.measured.clone(),
            sigma: self.config.encoder_sigma,
        }));
        self.stats.encoder_factors += 1;

        // Camera pose the landmark seeds are back-projected through.
        let offset = current.vector(&VarKey::JointOffset)?.clone();
        let theta = &record.commanded + &offset;
        let fk = self.kinematics.forward(&theta)?;
        let seed_camera = pose_seed
            .compose(&fk)
            .compose(current.pose(&VarKey::Extrinsic)?);

        for obs in &record.observations {
            let key = VarKey::Landmark(obs.landmark);
            if !current.contains(&key) {
                let ray = self.camera.back_project(&obs.pixel, self.config.assumed_depth);
                let seed = seed_camera.transform_point(&ray);
                Self::add_variable(current, key, VarValue::Point(seed))?;
                initial.insert(key, VarValue::Point(seed));
                self.stats.landmarks_created += 1;
                debug!(landmark = obs.landmark, step = index, "seeded new landmark");
            }

            self.factors.push(Factor::Projection(ProjectionFactor {
                step: index,
                landmark: obs.landmark,
                commanded: record.commanded.clone(),
                pixel: obs.pixel,
                sigma: self.config.pixel_sigma,
            }));
            self.stats.projection_factors += 1;
        }

        self.steps.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CalibError;

    fn graph_setup() -> (CalibrationGraph, Values, Values) {
        let graph = CalibrationGraph::new(
            GraphConfig::default(),
            KinematicModel::default_6dof(),
            PinholeCamera::new(520.0, 520.0, 320.0, 240.0),
        );
        (graph, Values::new(), Values::new())
    }

    fn step_record(n_obs: usize) -> StepRecord {
        StepRecord {
            commanded: na::DVector::zeros(6),
            measured: na::DVector::zeros(6),
            observations: (0..n_obs)
                .map(|i| Observation {
                    step: 0,
                    landmark: i as u64,
                    pixel: na::Vector2::new(320.0 + i as f64, 240.0),
                })
                .collect(),
        }
    }

    #[test]
    fn test_step_zero_creates_globals_and_anchors() {
        let (mut graph, mut initial, mut current) = graph_setup();
        graph
            .add_step(0, step_record(2), &mut initial, &mut current)
            .unwrap();

        assert!(current.vector(&VarKey::JointOffset).is_ok());
        assert!(current.pose(&VarKey::Extrinsic).is_ok());
        assert!(current.pose(&VarKey::Pose(0)).is_ok());
        assert!(current.point(&VarKey::Landmark(0)).is_ok());
        assert!(current.point(&VarKey::Landmark(1)).is_ok());

        let stats = graph.stats();
        assert_eq!(stats.prior_factors, 2);
        assert_eq!(stats.encoder_factors, 1);
        assert_eq!(stats.projection_factors, 2);
        assert_eq!(stats.landmarks_created, 2);
    }

    #[test]
    fn test_factor_counts_after_k_steps() {
        let (mut graph, mut initial, mut current) = graph_setup();
        let k = 5;
        for i in 0..k {
            graph
                .add_step(i, step_record(3), &mut initial, &mut current)
                .unwrap();
        }

        let stats = graph.stats();
        assert_eq!(stats.encoder_factors, k);
        assert_eq!(stats.projection_factors, 3 * k);
        assert_eq!(stats.landmarks_created, 3);
        assert_eq!(
            graph.factors().len(),
            stats.encoder_factors + stats.projection_factors + stats.prior_factors
        );
    }

    #[test]
    fn test_out_of_order_step_rejected_and_graph_unchanged() {
        let (mut graph, mut initial, mut current) = graph_setup();
        graph
            .add_step(0, step_record(1), &mut initial, &mut current)
            .unwrap();
        let factors_before = graph.factors().len();
        let vars_before = current.len();

        let err = graph
            .add_step(2, step_record(1), &mut initial, &mut current)
            .unwrap_err();
        assert!(matches!(
            err,
            CalibError::Graph(GraphError::StepOutOfOrder {
                expected: 1,
                actual: 2
            })
        ));
        assert_eq!(graph.factors().len(), factors_before);
        assert_eq!(current.len(), vars_before);
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let (mut graph, mut initial, mut current) = graph_setup();
        graph
            .add_step(0, step_record(1), &mut initial, &mut current)
            .unwrap();
        let err = graph
            .add_step(0, step_record(1), &mut initial, &mut current)
            .unwrap_err();
        assert!(matches!(
            err,
            CalibError::Graph(GraphError::StepOutOfOrder { .. })
        ));
    }

    #[test]
    fn test_landmarks_reused_across_steps() {
        let (mut graph, mut initial, mut current) = graph_setup();
        graph
            .add_step(0, step_record(2), &mut initial, &mut current)
            .unwrap();
        graph
            .add_step(1, step_record(2), &mut initial, &mut current)
            .unwrap();
        assert_eq!(graph.stats().landmarks_created, 2);
    }

    #[test]
    fn test_dof_mismatch_rejected() {
        let (mut graph, mut initial, mut current) = graph_setup();
        let record = StepRecord {
            commanded: na::DVector::zeros(4),
            measured: na::DVector::zeros(4),
            observations: vec![],
        };
        let err = graph.add_step(0, record, &mut initial, &mut current).unwrap_err();
        assert!(matches!(err, CalibError::Model(ModelError::DofMismatch { .. })));
    }
}
