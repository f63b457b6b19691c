//! Synthetic world generation.
//!
//! The simulator owns a reproducible synthetic ground truth: a fixed
//! landmark map, a fixed (optionally drifting) camera extrinsic, a constant
//! true joint offset, and per-step joint perturbations. Each step produces
//! noisy pixel observations of every landmark in the field of view.
//!
//! The constant true offset and the per-step motion perturbation are two
//! explicitly independent random processes with separate seeds.

pub mod trajectory;

use nalgebra as na;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};
use tracing::debug;

use crate::camera::PinholeCamera;
use crate::error::ModelError;
use crate::graph::{Observation, VarKey, VarValue, Values};
use crate::kinematics::KinematicModel;
use crate::pose::{Pose, Vector6};
use trajectory::LoadError;

/// A zero-mean scalar noise distribution with explicit bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoiseModel {
    /// Gaussian with the given standard deviation.
    Gaussian { sigma: f64 },
    /// Uniform on `[-bound, +bound]`.
    Uniform { bound: f64 },
}

impl NoiseModel {
    /// A distribution that always samples zero.
    pub fn zero() -> Self {
        NoiseModel::Uniform { bound: 0.0 }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            NoiseModel::Gaussian { sigma } => *sigma == 0.0,
            NoiseModel::Uniform { bound } => *bound == 0.0,
        }
    }

    pub fn sample(&self, rng: &mut StdRng) -> f64 {
        match self {
            NoiseModel::Gaussian { sigma } => {
                if *sigma == 0.0 {
                    return 0.0;
                }
                match Normal::new(0.0, *sigma) {
                    Ok(normal) => normal.sample(rng),
                    Err(_) => 0.0,
                }
            }
            NoiseModel::Uniform { bound } => {
                if *bound == 0.0 {
                    return 0.0;
                }
                Uniform::new_inclusive(-bound, *bound).sample(rng)
            }
        }
    }

    pub fn sample_vector(&self, rng: &mut StdRng, len: usize) -> na::DVector<f64> {
        na::DVector::from_fn(len, |_, _| self.sample(rng))
    }
}

/// Simulation configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Expected trajectory length; a mismatching resource is fatal.
    pub trajectory_size: usize,
    /// Number of landmarks sampled once at construction.
    pub landmark_count: usize,
    /// Pixel margin kept when sampling landmarks inside the step-0 view.
    pub landmark_margin: f64,
    /// Depth range (meters) the landmarks are sampled in.
    pub landmark_depth: (f64, f64),
    /// Per-step zero-mean perturbation of the true joint state
    /// (unmodeled motion / backlash).
    pub joint_perturbation: NoiseModel,
    /// Pixel observation noise.
    pub pixel_noise: NoiseModel,
    /// Distribution of the constant true joint offset.
    pub offset_noise: NoiseModel,
    /// Ground-truth extrinsic = nominal ⊞ this tangent perturbation.
    pub extrinsic_perturbation: Vector6,
    /// Optional per-step random-walk drift of the true extrinsic.
    pub extrinsic_drift: Option<NoiseModel>,
    /// Seed of the landmark / pixel-noise / drift streams.
    pub seed: u64,
    /// Seed of the per-step motion perturbation stream.
    pub motion_seed: u64,
    /// Seed of the constant-offset draw.
    pub offset_seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            trajectory_size: 50,
            landmark_count: 20,
            landmark_margin: 60.0,
            landmark_depth: (1.2, 2.5),
            joint_perturbation: NoiseModel::Uniform { bound: 0.01 },
            pixel_noise: NoiseModel::Gaussian { sigma: 0.5 },
            offset_noise: NoiseModel::Uniform { bound: 0.03 },
            extrinsic_perturbation: Vector6::zeros(),
            extrinsic_drift: None,
            seed: 7,
            motion_seed: 101,
            offset_seed: 202,
        }
    }
}

/// Everything one simulated step hands to the estimator, plus the true
/// joint state for ground-truth bookkeeping.
#[derive(Debug, Clone)]
pub struct StepData {
    pub index: usize,
    pub commanded: na::DVector<f64>,
    pub measured: na::DVector<f64>,
    pub true_joints: na::DVector<f64>,
    pub observations: Vec<Observation>,
}

impl StepData {
    /// The offset actually applied at this step (true minus commanded).
    pub fn applied_offset(&self) -> na::DVector<f64> {
        &self.true_joints - &self.commanded
    }
}

/// Counters for suppressed conditions, observable by tests and logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimStats {
    /// Landmarks that fell outside the field of view at some step.
    pub suppressed_observations: usize,
}

/// Reproducible synthetic world.
#[derive(Debug)]
pub struct Simulator {
    config: SimConfig,
    kinematics: KinematicModel,
    camera: PinholeCamera,
    nominal_extrinsic: Pose,
    trajectory: Vec<na::DVector<f64>>,
    landmarks: Vec<(u64, na::Vector3<f64>)>,
    true_extrinsic: Pose,
    true_offset: na::DVector<f64>,
    motion_rng: StdRng,
    noise_rng: StdRng,
    stats: SimStats,
}

impl Simulator {
    /// Build the synthetic world from pre-parsed trajectory rows.
    ///
    /// Landmarks are sampled once inside the step-0 camera frustum; the
    /// ground-truth extrinsic and constant offset are drawn once and held
    /// for the run.
    pub fn from_rows(
        config: SimConfig,
        kinematics: KinematicModel,
        camera: PinholeCamera,
        nominal_extrinsic: Pose,
        rows: Vec<na::DVector<f64>>,
    ) -> crate::error::CalibResult<Self> {
        if rows.len() != config.trajectory_size {
            return Err(LoadError::TrajectorySize {
                expected: config.trajectory_size,
                actual: rows.len(),
            }
            .into());
        }
        for row in &rows {
            if row.len() != kinematics.dof() {
                return Err(LoadError::ArityMismatch {
                    line: 0,
                    expected: kinematics.dof(),
                    actual: row.len(),
                }
                .into());
            }
        }

        let true_extrinsic = nominal_extrinsic.retract(&config.extrinsic_perturbation);

        let mut offset_rng = StdRng::seed_from_u64(config.offset_seed);
        let true_offset = config
            .offset_noise
            .sample_vector(&mut offset_rng, kinematics.dof());

        // Landmarks sampled in the true step-0 view so every landmark
        // starts visible.
        let mut noise_rng = StdRng::seed_from_u64(config.seed);
        let first = &rows[0];
        let fk0 = kinematics.forward(&(first + &true_offset))?;
        let camera0 = fk0.compose(&true_extrinsic);

        let (depth_min, depth_max) = config.landmark_depth;
        let margin = config.landmark_margin;
        let u_range = Uniform::new(margin, 2.0 * camera.cx - margin);
        let v_range = Uniform::new(margin, 2.0 * camera.cy - margin);
        let depth_range = Uniform::new_inclusive(depth_min, depth_max);
        let landmarks = (0..config.landmark_count)
            .map(|id| {
                let pixel = na::Vector2::new(
                    u_range.sample(&mut noise_rng),
                    v_range.sample(&mut noise_rng),
                );
                let depth = depth_range.sample(&mut noise_rng);
                let local = camera.back_project(&pixel, depth);
                (id as u64, camera0.transform_point(&local))
            })
            .collect();

        Ok(Self {
            config: config.clone(),
            kinematics,
            camera,
            nominal_extrinsic,
            trajectory: rows,
            landmarks,
            true_extrinsic,
            true_offset,
            motion_rng: StdRng::seed_from_u64(config.motion_seed),
            noise_rng,
            stats: SimStats::default(),
        })
    }

    /// Build the synthetic world from a trajectory file.
    pub fn from_file(
        config: SimConfig,
        kinematics: KinematicModel,
        camera: PinholeCamera,
        nominal_extrinsic: Pose,
        path: &std::path::Path,
    ) -> crate::error::CalibResult<Self> {
        let rows = trajectory::load(path, kinematics.dof()).map_err(crate::error::CalibError::from)?;
        Self::from_rows(config, kinematics, camera, nominal_extrinsic, rows)
    }

    pub fn trajectory_len(&self) -> usize {
        self.trajectory.len()
    }

    pub fn true_offset(&self) -> &na::DVector<f64> {
        &self.true_offset
    }

    pub fn true_extrinsic(&self) -> &Pose {
        &self.true_extrinsic
    }

    pub fn nominal_extrinsic(&self) -> &Pose {
        &self.nominal_extrinsic
    }

    pub fn landmarks(&self) -> &[(u64, na::Vector3<f64>)] {
        &self.landmarks
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }

    /// Generate step `index`: perturb the commanded joints, project every
    /// visible landmark, add pixel noise. Landmarks outside the view are
    /// suppressed and counted, never an error.
    pub fn step(&mut self, index: usize) -> Result<StepData, ModelError> {
        let commanded = self
            .trajectory
            .get(index)
            .ok_or(ModelError::StepOutOfRange {
                index,
                len: self.trajectory.len(),
            })?
            .clone();

        if let Some(drift) = self.config.extrinsic_drift {
            let mut delta = Vector6::zeros();
            for i in 0..6 {
                delta[i] = drift.sample(&mut self.noise_rng);
            }
            self.true_extrinsic = self.true_extrinsic.retract(&delta);
        }

        let perturbation = self
            .config
            .joint_perturbation
            .sample_vector(&mut self.motion_rng, commanded.len());
        let true_joints = &commanded + &self.true_offset + &perturbation;

        let fk = self.kinematics.forward(&true_joints)?;
        let world_from_camera = fk.compose(&self.true_extrinsic);

        let mut observations = Vec::new();
        for (id, position) in &self.landmarks {
            let local = world_from_camera.inverse_transform_point(position);
            match self.camera.project(&local) {
                Ok(pixel) => {
                    let noisy = na::Vector2::new(
                        pixel.x + self.config.pixel_noise.sample(&mut self.noise_rng),
                        pixel.y + self.config.pixel_noise.sample(&mut self.noise_rng),
                    );
                    observations.push(Observation {
                        step: index,
                        landmark: *id,
                        pixel: noisy,
                    });
                }
                Err(err) => {
                    self.stats.suppressed_observations += 1;
                    debug!(step = index, landmark = id, %err, "observation suppressed");
                }
            }
        }

        Ok(StepData {
            index,
            // The encoder reads back the commanded angles; the true offset
            // and backlash are exactly what it cannot see.
            measured: commanded.clone(),
            commanded,
            true_joints,
            observations,
        })
    }

    /// Record the ground-truth estimate entries for a generated step.
    ///
    /// Inserts the constant offset and extrinsic, the (identity) base pose
    /// of the step, and every landmark that has been observed at least
    /// once, mirroring the estimator's lazy landmark creation.
    pub fn record_ground_truth(&self, step: &StepData, ground_truth: &mut Values) {
        ground_truth.insert(
            VarKey::JointOffset,
            VarValue::Vector(self.true_offset.clone()),
        );
        ground_truth.insert(
            VarKey::Extrinsic,
            VarValue::Pose(self.true_extrinsic.clone()),
        );
        ground_truth.insert(VarKey::Pose(step.index), VarValue::Pose(Pose::identity()));
        for obs in &step.observations {
            let key = VarKey::Landmark(obs.landmark);
            if !ground_truth.contains(&key) {
                if let Some((_, position)) = self
                    .landmarks
                    .iter()
                    .find(|(id, _)| *id == obs.landmark)
                {
                    ground_truth.insert(key, VarValue::Point(*position));
                }
            }
        }
    }
}
