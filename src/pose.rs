//! Rigid 3-D transforms on the R³ × SO(3) product manifold.
//!
//! [`Pose`] stores a unit quaternion plus a translation and exposes the
//! tangent-space `retract`/`local` pair used by the optimizers. The tangent
//! layout is `[dt, dw]` (linear first, then angular), and the rotation is
//! renormalized after every update so the orthonormality invariant holds
//! even under long chains of small retractions.

use nalgebra as na;

/// 6-dimensional tangent vector of a pose: `[dt_x, dt_y, dt_z, dw_x, dw_y, dw_z]`.
pub type Vector6 = na::Vector6<f64>;

/// A rigid 3-D transform (rotation + translation).
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    rotation: na::UnitQuaternion<f64>,
    translation: na::Vector3<f64>,
}

impl Pose {
    /// Degrees of freedom of the tangent space.
    pub const DOF: usize = 6;

    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: na::UnitQuaternion::identity(),
            translation: na::Vector3::zeros(),
        }
    }

    /// Build a pose from a rotation and a translation. The quaternion is
    /// renormalized on entry.
    pub fn new(rotation: na::UnitQuaternion<f64>, translation: na::Vector3<f64>) -> Self {
        Self {
            rotation: na::UnitQuaternion::new_normalize(rotation.into_inner()),
            translation,
        }
    }

    /// Build a pose from a translation and a rotation about a scaled axis.
    pub fn from_parts(translation: na::Vector3<f64>, scaled_axis: na::Vector3<f64>) -> Self {
        Self::new(
            na::UnitQuaternion::from_scaled_axis(scaled_axis),
            translation,
        )
    }

    pub fn rotation(&self) -> &na::UnitQuaternion<f64> {
        &self.rotation
    }

    pub fn translation(&self) -> &na::Vector3<f64> {
        &self.translation
    }

    pub fn rotation_matrix(&self) -> na::Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Group composition: `self ∘ other`.
    pub fn compose(&self, other: &Pose) -> Pose {
        Pose::new(
            self.rotation * other.rotation,
            self.translation + self.rotation * other.translation,
        )
    }

    /// Group inverse.
    pub fn inverse(&self) -> Pose {
        let inv_rot = self.rotation.inverse();
        Pose::new(inv_rot, -(inv_rot * self.translation))
    }

    /// Apply the transform to a point: `R p + t`.
    pub fn transform_point(&self, point: &na::Vector3<f64>) -> na::Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// Apply the inverse transform to a point: `Rᵀ (p − t)`.
    pub fn inverse_transform_point(&self, point: &na::Vector3<f64>) -> na::Vector3<f64> {
        self.rotation.inverse() * (point - self.translation)
    }

    /// Apply a tangent-space perturbation: `t += dt`, `R ← R · exp(dw)`.
    ///
    /// The resulting rotation is renormalized.
    pub fn retract(&self, delta: &Vector6) -> Pose {
        let dt = na::Vector3::new(delta[0], delta[1], delta[2]);
        let dw = na::Vector3::new(delta[3], delta[4], delta[5]);
        Pose::new(
            self.rotation * na::UnitQuaternion::from_scaled_axis(dw),
            self.translation + dt,
        )
    }

    /// Tangent vector carrying `self` onto `other`:
    /// `[t_o − t_s, log(R_sᵀ R_o)]`. Inverse of [`Pose::retract`].
    pub fn local(&self, other: &Pose) -> Vector6 {
        let dt = other.translation - self.translation;
        let dw = (self.rotation.inverse() * other.rotation).scaled_axis();
        Vector6::new(dt[0], dt[1], dt[2], dw[0], dw[1], dw[2])
    }

    /// Rotation angle (radians) between `self` and `other`.
    pub fn rotation_angle_to(&self, other: &Pose) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }

    /// Euclidean distance between the two translations.
    pub fn translation_distance_to(&self, other: &Pose) -> f64 {
        (self.translation - other.translation).norm()
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for &Pose {
    type Output = Pose;

    fn mul(self, rhs: &Pose) -> Pose {
        self.compose(rhs)
    }
}

/// Skew-symmetric (hat) matrix of a 3-vector, `[v]×`.
pub fn skew(v: &na::Vector3<f64>) -> na::Matrix3<f64> {
    na::Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_3;

    fn sample_pose() -> Pose {
        Pose::from_parts(
            na::Vector3::new(0.3, -0.2, 1.1),
            na::Vector3::new(0.1, 0.4, -0.2),
        )
    }

    #[test]
    fn test_retract_local_round_trip() {
        let pose = sample_pose();
        let delta = Vector6::new(0.05, -0.02, 0.01, 0.03, -0.04, 0.02);

        let moved = pose.retract(&delta);
        let recovered = pose.local(&moved);

        for i in 0..6 {
            assert!(
                (recovered[i] - delta[i]).abs() < 1e-10,
                "component {i}: {} vs {}",
                recovered[i],
                delta[i]
            );
        }
    }

    #[test]
    fn test_retract_keeps_rotation_orthonormal() {
        let mut pose = sample_pose();
        let delta = Vector6::new(1e-8, 0.0, 0.0, 1e-8, 1e-8, 0.0);
        for _ in 0..10_000 {
            pose = pose.retract(&delta);
        }
        assert!((pose.rotation().norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_compose_inverse_is_identity() {
        let pose = sample_pose();
        let round = pose.compose(&pose.inverse());
        assert!(round.translation().norm() < 1e-12);
        assert!(round.rotation().angle() < 1e-12);
    }

    #[test]
    fn test_inverse_transform_point() {
        let pose = sample_pose();
        let p = na::Vector3::new(1.0, 2.0, 3.0);
        let q = pose.transform_point(&p);
        let back = pose.inverse_transform_point(&q);
        assert!((back - p).norm() < 1e-12);
    }

    #[test]
    fn test_rotation_angle_to() {
        let a = Pose::identity();
        let b = Pose::from_parts(na::Vector3::zeros(), na::Vector3::new(0.0, 0.0, FRAC_PI_3));
        assert!((a.rotation_angle_to(&b) - FRAC_PI_3).abs() < 1e-12);
    }

    #[test]
    fn test_skew_matches_cross_product() {
        let a = na::Vector3::new(0.3, -1.2, 0.7);
        let b = na::Vector3::new(-0.5, 0.1, 2.0);
        assert!((skew(&a) * b - a.cross(&b)).norm() < 1e-14);
    }
}
