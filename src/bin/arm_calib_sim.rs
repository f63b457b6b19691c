//! Simulation driver: runs the simulate-then-optimize loop over a
//! synthetic trajectory and writes the per-step diagnostic files.
//!
//! Usage: `arm_calib_sim [trajectory.txt]`. Without an argument a gentle
//! sinusoidal sweep over all joints is generated in memory.

use std::f64::consts::PI;
use std::fs::File;
use std::io::{BufWriter, Write};

use nalgebra as na;
use tracing::{error, info, warn};

use arm_calib::camera::PinholeCamera;
use arm_calib::engine::{CalibrationEngine, CalibrationParams};
use arm_calib::error::{CalibError, CalibResult};
use arm_calib::kinematics::KinematicModel;
use arm_calib::optimizer::OptimizeError;
use arm_calib::pose::Vector6;
use arm_calib::sim::{trajectory, NoiseModel, SimConfig};

/// A smooth sweep that keeps the landmark cloud mostly in view while
/// giving the optimizer enough motion diversity.
fn default_trajectory(steps: usize, dof: usize) -> Vec<na::DVector<f64>> {
    (0..steps)
        .map(|i| {
            let phase = i as f64 / steps as f64 * 2.0 * PI;
            na::DVector::from_fn(dof, |j, _| {
                0.12 * (phase + j as f64 * PI / 3.0).sin()
            })
        })
        .collect()
}

fn run() -> CalibResult<()> {
    let kinematics = KinematicModel::default_6dof();
    let camera = PinholeCamera::new(520.0, 520.0, 320.0, 240.0).with_bounds(640.0, 480.0);

    let params = CalibrationParams::default()
        .with_trajectory_size(50)
        .with_sim(SimConfig {
            joint_perturbation: NoiseModel::Uniform { bound: 0.01 },
            pixel_noise: NoiseModel::Gaussian { sigma: 0.5 },
            offset_noise: NoiseModel::Uniform { bound: 0.03 },
            extrinsic_perturbation: Vector6::new(0.02, -0.015, 0.01, 0.02, -0.01, 0.015),
            ..SimConfig::default()
        });

    let rows = match std::env::args().nth(1) {
        Some(path) => trajectory::load(std::path::Path::new(&path), kinematics.dof())
            .map_err(CalibError::from)?,
        None => default_trajectory(params.trajectory_size, kinematics.dof()),
    };

    let mut engine = CalibrationEngine::new_simulated(params, kinematics, camera, rows)?;
    let steps = engine.params().trajectory_size;

    let mut offset_file = BufWriter::new(File::create("offsets.txt")?);
    let mut extrinsic_file = BufWriter::new(File::create("extrinsic_errors.txt")?);
    let mut error_file = BufWriter::new(File::create("error.txt")?);

    info!(steps, "starting simulated calibration run");
    for i in 0..steps {
        engine.simulation_step(i)?;
        if i > 1 {
            match engine.optimize_step() {
                Ok(_) => {}
                Err(CalibError::Optimize(OptimizeError::NotConverged { .. }))
                | Err(CalibError::Optimize(OptimizeError::SingularSystem)) => {
                    // Recoverable: the estimate is retained and the next
                    // step adds more constraints.
                }
                Err(err) => return Err(err),
            }
        }

        writeln!(offset_file, "{}", engine.joint_offset_record(i)?)?;
        writeln!(extrinsic_file, "{}", engine.extrinsic_record())?;
        writeln!(error_file, "{}", engine.error_record())?;
    }

    let final_error = engine.compute_error();
    info!(
        landmark_error = final_error.landmark_error,
        extrinsic_error = final_error.extrinsic_error,
        joint_angle_error = final_error.joint_angle_error,
        "run finished"
    );
    if let Some(simulator) = engine.simulator() {
        let stats = simulator.stats();
        if stats.suppressed_observations > 0 {
            warn!(
                suppressed = stats.suppressed_observations,
                "some landmark observations fell outside the field of view"
            );
        }
    }
    Ok(())
}

fn main() {
    arm_calib::init_logger();
    if let Err(err) = run() {
        error!(%err, "calibration run aborted");
        std::process::exit(1);
    }
}
