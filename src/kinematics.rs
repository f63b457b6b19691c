//! Forward kinematics of a serial revolute chain.
//!
//! [`KinematicModel`] maps a joint-angle vector to the end-effector pose in
//! the base frame, together with the analytic partial of the pose with
//! respect to each joint angle. Partials are returned as body-frame twists
//! `ξ_j = [v, ω]` satisfying `dT/dθ_j = T · ξ̂_j`, which is the form the
//! projection factor chains directly into its point Jacobian.

use nalgebra as na;

use crate::error::ModelError;
use crate::pose::{Pose, Vector6};

/// A single revolute joint: a fixed origin transform relative to the
/// previous joint frame, followed by a rotation about `axis`.
#[derive(Debug, Clone)]
pub struct Joint {
    pub origin: Pose,
    pub axis: na::Unit<na::Vector3<f64>>,
}

impl Joint {
    pub fn new(origin: Pose, axis: na::Unit<na::Vector3<f64>>) -> Self {
        Self { origin, axis }
    }
}

/// Forward kinematics of a fixed serial chain. Pure and deterministic.
#[derive(Debug, Clone)]
pub struct KinematicModel {
    joints: Vec<Joint>,
}

impl KinematicModel {
    pub fn new(joints: Vec<Joint>) -> Self {
        Self { joints }
    }

    /// Degree-of-freedom count of the chain.
    pub fn dof(&self) -> usize {
        self.joints.len()
    }

    /// A 6-dof chain with the link lengths and axis pattern of the arm the
    /// simulation models.
    pub fn default_6dof() -> Self {
        let z = na::Vector3::z_axis();
        let y = na::Vector3::y_axis();
        let x = na::Vector3::x_axis();
        Self::new(vec![
            Joint::new(
                Pose::from_parts(na::Vector3::new(0.0, 0.0, 0.157), na::Vector3::zeros()),
                z,
            ),
            Joint::new(
                Pose::from_parts(na::Vector3::new(0.0, 0.0, 0.119), na::Vector3::zeros()),
                y,
            ),
            Joint::new(
                Pose::from_parts(na::Vector3::new(0.0, 0.0, 0.290), na::Vector3::zeros()),
                y,
            ),
            Joint::new(
                Pose::from_parts(na::Vector3::new(0.0, 0.0, 0.123), na::Vector3::zeros()),
                x,
            ),
            Joint::new(
                Pose::from_parts(na::Vector3::new(0.037, 0.0, 0.064), na::Vector3::zeros()),
                y,
            ),
            Joint::new(
                Pose::from_parts(na::Vector3::new(0.037, 0.0, 0.064), na::Vector3::zeros()),
                x,
            ),
        ])
    }

    fn check_dof(&self, joints: &na::DVector<f64>) -> Result<(), ModelError> {
        if joints.len() != self.joints.len() {
            return Err(ModelError::DofMismatch {
                expected: self.joints.len(),
                actual: joints.len(),
            });
        }
        Ok(())
    }

    /// End-effector pose in the base frame for the given joint angles.
    pub fn forward(&self, joints: &na::DVector<f64>) -> Result<Pose, ModelError> {
        self.check_dof(joints)?;
        let mut pose = Pose::identity();
        for (joint, &angle) in self.joints.iter().zip(joints.iter()) {
            pose = pose
                .compose(&joint.origin)
                .compose(&Pose::from_parts(
                    na::Vector3::zeros(),
                    joint.axis.into_inner() * angle,
                ));
        }
        Ok(pose)
    }

    /// End-effector pose plus the per-joint body-frame twist partials.
    ///
    /// For joint `j` with suffix transform `S_j = P_j⁻¹ T` (end effector
    /// expressed in the frame just after joint `j`), the twist is
    /// `ω = R_sᵀ a_j`, `v = R_sᵀ (a_j × t_s)`.
    pub fn forward_with_partials(
        &self,
        joints: &na::DVector<f64>,
    ) -> Result<(Pose, Vec<Vector6>), ModelError> {
        self.check_dof(joints)?;

        // Prefix poses after each joint's rotation.
        let mut prefixes = Vec::with_capacity(self.joints.len());
        let mut pose = Pose::identity();
        for (joint, &angle) in self.joints.iter().zip(joints.iter()) {
            pose = pose
                .compose(&joint.origin)
                .compose(&Pose::from_parts(
                    na::Vector3::zeros(),
                    joint.axis.into_inner() * angle,
                ));
            prefixes.push(pose.clone());
        }
        let end_effector = pose;

        let mut twists = Vec::with_capacity(self.joints.len());
        for (joint, prefix) in self.joints.iter().zip(prefixes.iter()) {
            let suffix = prefix.inverse().compose(&end_effector);
            let rs_t = suffix.rotation_matrix().transpose();
            let axis = joint.axis.into_inner();
            let omega = rs_t * axis;
            let v = rs_t * axis.cross(suffix.translation());
            twists.push(Vector6::new(v[0], v[1], v[2], omega[0], omega[1], omega[2]));
        }

        Ok((end_effector, twists))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn two_link_planar() -> KinematicModel {
        // Two links of length 1 along x, both rotating about z.
        KinematicModel::new(vec![
            Joint::new(Pose::identity(), na::Vector3::z_axis()),
            Joint::new(
                Pose::from_parts(na::Vector3::new(1.0, 0.0, 0.0), na::Vector3::zeros()),
                na::Vector3::z_axis(),
            ),
        ])
    }

    #[test]
    fn test_dof_mismatch_rejected() {
        let model = two_link_planar();
        let err = model.forward(&na::DVector::zeros(3)).unwrap_err();
        assert_eq!(
            err,
            ModelError::DofMismatch {
                expected: 2,
                actual: 3
            }
        );
    }

    #[test]
    fn test_planar_forward_kinematics() {
        let model = two_link_planar();

        // Straight out along x: tip of the second link origin at (1, 0, 0).
        let pose = model
            .forward(&na::DVector::from_vec(vec![0.0, 0.0]))
            .unwrap();
        assert!((pose.translation() - na::Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-12);

        // First joint at 90°: the link now points along y.
        let pose = model
            .forward(&na::DVector::from_vec(vec![FRAC_PI_2, 0.0]))
            .unwrap();
        assert!((pose.translation() - na::Vector3::new(0.0, 1.0, 0.0)).norm() < 1e-9);
    }

    #[test]
    fn test_twist_partials_match_finite_differences() {
        let model = KinematicModel::default_6dof();
        let q = na::DVector::from_vec(vec![0.1, -0.3, 0.2, 0.5, -0.1, 0.4]);
        let (pose, twists) = model.forward_with_partials(&q).unwrap();

        let eps = 1e-7;
        let r_t = pose.rotation_matrix().transpose();
        for j in 0..model.dof() {
            let mut q_plus = q.clone();
            q_plus[j] += eps;
            let pose_plus = model.forward(&q_plus).unwrap();

            // dT/dθ = T·ξ̂ means dt = R v and dR = R [ω]×, so the
            // finite-difference twist is read off in the body frame.
            let fd_v = r_t * (pose_plus.translation() - pose.translation()) / eps;
            let fd_w = (pose.rotation().inverse() * pose_plus.rotation()).scaled_axis() / eps;
            let analytic = &twists[j];
            for i in 0..3 {
                assert!(
                    (fd_v[i] - analytic[i]).abs() < 1e-5,
                    "joint {j} linear component {i}: fd {} vs analytic {}",
                    fd_v[i],
                    analytic[i]
                );
                assert!(
                    (fd_w[i] - analytic[i + 3]).abs() < 1e-5,
                    "joint {j} angular component {i}: fd {} vs analytic {}",
                    fd_w[i],
                    analytic[i + 3]
                );
            }
        }
    }

    #[test]
    fn test_forward_is_deterministic() {
        let model = KinematicModel::default_6dof();
        let q = na::DVector::from_vec(vec![0.3, 0.1, -0.2, 0.0, 0.7, -0.5]);
        let a = model.forward(&q).unwrap();
        let b = model.forward(&q).unwrap();
        assert_eq!(a, b);
    }
}
