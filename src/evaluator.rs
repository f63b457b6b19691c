//! Error metrics between two estimates.
//!
//! Pure functions of the two `Values` instances: only keys present in both
//! are compared, keys present in one but not the other are ignored. The
//! aggregate is recomputed fresh at each query and never stored.

use nalgebra as na;

use crate::graph::{VarKey, VarValue, Values};

/// Aggregate calibration error against ground truth. All fields are ≥ 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationError {
    /// Mean Euclidean distance over the shared landmarks (meters).
    pub landmark_error: f64,
    /// Extrinsic deviation: translation norm plus rotation angle.
    pub extrinsic_error: f64,
    /// Norm of the joint-offset difference (radians).
    pub joint_angle_error: f64,
}

/// Compare an estimate against ground truth.
pub fn compute_error(ground: &Values, estimate: &Values) -> CalibrationError {
    let mut landmark_sum = 0.0;
    let mut landmark_count = 0usize;
    for key in ground.keys() {
        if let VarKey::Landmark(_) = key {
            if let (Ok(truth), Ok(guess)) = (ground.point(key), estimate.point(key)) {
                landmark_sum += (truth - guess).norm();
                landmark_count += 1;
            }
        }
    }
    let landmark_error = if landmark_count > 0 {
        landmark_sum / landmark_count as f64
    } else {
        0.0
    };

    let extrinsic_error = match (
        ground.pose(&VarKey::Extrinsic),
        estimate.pose(&VarKey::Extrinsic),
    ) {
        (Ok(truth), Ok(guess)) => {
            truth.translation_distance_to(guess) + truth.rotation_angle_to(guess)
        }
        _ => 0.0,
    };

    let joint_angle_error = match (
        ground.vector(&VarKey::JointOffset),
        estimate.vector(&VarKey::JointOffset),
    ) {
        (Ok(truth), Ok(guess)) => (truth - guess).norm(),
        _ => 0.0,
    };

    CalibrationError {
        landmark_error,
        extrinsic_error,
        joint_angle_error,
    }
}

/// Per-joint difference between the estimated and ground-truth offsets.
/// Zeros when either estimate lacks the offset variable.
pub fn joint_offset_error(ground: &Values, estimate: &Values, dof: usize) -> na::DVector<f64> {
    match (
        ground.vector(&VarKey::JointOffset),
        estimate.vector(&VarKey::JointOffset),
    ) {
        (Ok(truth), Ok(guess)) => guess - truth,
        _ => na::DVector::zeros(dof),
    }
}

/// Diagnostic projection: how far the current offset estimate has moved
/// from its initial seed.
pub fn joint_offset_progress(current: &Values, initial: &Values, dof: usize) -> na::DVector<f64> {
    match (
        current.vector(&VarKey::JointOffset),
        initial.vector(&VarKey::JointOffset),
    ) {
        (Ok(now), Ok(seed)) => now - seed,
        _ => na::DVector::zeros(dof),
    }
}

/// Diagnostic projection: the simulated constant offset versus the offset
/// actually applied at one step (backlash included).
pub fn sim_offset_deviation(
    ground: &Values,
    applied_offset: &na::DVector<f64>,
) -> na::DVector<f64> {
    match ground.vector(&VarKey::JointOffset) {
        Ok(truth) => truth - applied_offset,
        Err(_) => na::DVector::zeros(applied_offset.len()),
    }
}

/// Count the landmark keys shared by both estimates.
pub fn shared_landmarks(ground: &Values, estimate: &Values) -> usize {
    ground
        .keys()
        .filter(|key| {
            matches!(key, VarKey::Landmark(_))
                && matches!(estimate.get(key), Some(VarValue::Point(_)))
        })
        .count()
}
