//! Factors of the calibration graph.
//!
//! The factor kinds are a closed set (encoder, projection, prior), each
//! implementing the same capability: evaluate a whitened residual and its
//! block Jacobians at the current estimate. Factors are immutable once
//! created and are never removed from the graph.

use nalgebra as na;

use crate::camera::PinholeCamera;
use crate::error::ModelError;
use crate::graph::values::{VarKey, Values};
use crate::kinematics::KinematicModel;
use crate::pose::skew;

/// Whitened linearization of one factor: per-variable Jacobian blocks in
/// the same order as `keys`, plus the residual.
#[derive(Debug, Clone)]
pub struct Linearization {
    pub keys: Vec<VarKey>,
    pub jacobians: Vec<na::DMatrix<f64>>,
    pub residual: na::DVector<f64>,
}

/// Joint-angle-offset pseudo-measurement from one encoder readback.
///
/// Residual: `(commanded + offset) − measured`, one row per joint. In
/// simulation the measured vector equals the commanded one, which turns
/// this into the zero-mean encoder-bias prior for the step.
#[derive(Debug, Clone)]
pub struct EncoderFactor {
    pub step: usize,
    pub commanded: na::DVector<f64>,
    pub measured: na::DVector<f64>,
    pub sigma: f64,
}

/// Pixel observation of a landmark through the arm-mounted camera.
///
/// Residual: `π(E⁻¹ F(commanded + offset)⁻¹ P⁻¹ l) − pixel`, where `P` is
/// the base pose of the step, `F` the forward kinematics and `E` the
/// extrinsic.
#[derive(Debug, Clone)]
pub struct ProjectionFactor {
    pub step: usize,
    pub landmark: u64,
    pub commanded: na::DVector<f64>,
    pub pixel: na::Vector2<f64>,
    pub sigma: f64,
}

/// Anchors a pose variable to a fixed value (gauge removal).
#[derive(Debug, Clone)]
pub struct PriorFactor {
    pub key: VarKey,
    pub pose: crate::pose::Pose,
    pub sigma: f64,
}

/// A constraint tying one or more variables to a measurement. Closed set;
/// no open-ended plugin mechanism is needed.
#[derive(Debug, Clone)]
pub enum Factor {
    Encoder(EncoderFactor),
    Projection(ProjectionFactor),
    Prior(PriorFactor),
}

impl Factor {
    /// Variable keys this factor constrains, in Jacobian block order.
    pub fn keys(&self) -> Vec<VarKey> {
        match self {
            Factor::Encoder(_) => vec![VarKey::JointOffset],
            Factor::Projection(f) => vec![
                VarKey::Pose(f.step),
                VarKey::JointOffset,
                VarKey::Extrinsic,
                VarKey::Landmark(f.landmark),
            ],
            Factor::Prior(f) => vec![f.key],
        }
    }

    /// Residual dimension.
    pub fn dimension(&self) -> usize {
        match self {
            Factor::Encoder(f) => f.commanded.len(),
            Factor::Projection(_) => 2,
            Factor::Prior(_) => 6,
        }
    }

    /// Evaluate the whitened residual and Jacobian blocks at `values`.
    ///
    /// Returns `Ok(None)` when a projection factor's landmark is not
    /// visible at the current linearization point; the factor contributes
    /// nothing to this solve and the caller counts the suppression.
    pub fn linearize(
        &self,
        values: &Values,
        model: &KinematicModel,
        camera: &PinholeCamera,
    ) -> Result<Option<Linearization>, ModelError> {
        match self {
            Factor::Encoder(f) => f.linearize(values),
            Factor::Projection(f) => f.linearize(values, model, camera),
            Factor::Prior(f) => f.linearize(values),
        }
    }
}

impl EncoderFactor {
    fn linearize(&self, values: &Values) -> Result<Option<Linearization>, ModelError> {
        let offset = values.vector(&VarKey::JointOffset)?;
        let dof = self.commanded.len();

        let weight = 1.0 / self.sigma;
        let residual = (&self.commanded + offset - &self.measured) * weight;
        let jacobian = na::DMatrix::identity(dof, dof) * weight;

        Ok(Some(Linearization {
            keys: vec![VarKey::JointOffset],
            jacobians: vec![jacobian],
            residual,
        }))
    }
}

impl ProjectionFactor {
    fn linearize(
        &self,
        values: &Values,
        model: &KinematicModel,
        camera: &PinholeCamera,
    ) -> Result<Option<Linearization>, ModelError> {
        let pose = values.pose(&VarKey::Pose(self.step))?;
        let offset = values.vector(&VarKey::JointOffset)?;
        let extrinsic = values.pose(&VarKey::Extrinsic)?;
        let landmark = values.point(&VarKey::Landmark(self.landmark))?;

        let theta = &self.commanded + offset;
        let (fk, twists) = model.forward_with_partials(&theta)?;

        // Landmark expressed in the base, end-effector and camera frames.
        let u = pose.inverse_transform_point(landmark);
        let w = fk.inverse_transform_point(&u);
        let x = extrinsic.inverse_transform_point(&w);

        let (pixel, d_pixel) = match camera.project_with_jacobian(&x) {
            Ok(projection) => projection,
            Err(_) => return Ok(None),
        };

        let r_e_t = extrinsic.rotation_matrix().transpose();
        let r_f_t = fk.rotation_matrix().transpose();
        let r_p_t = pose.rotation_matrix().transpose();
        let r_ef_t = r_e_t * r_f_t;
        let r_efp_t = r_ef_t * r_p_t;

        // Base pose block: [∂x/∂t_p | ∂x/∂φ_p].
        let mut d_pose = na::DMatrix::zeros(3, 6);
        d_pose.view_mut((0, 0), (3, 3)).copy_from(&(-r_efp_t));
        d_pose
            .view_mut((0, 3), (3, 3))
            .copy_from(&(r_ef_t * skew(&u)));

        // Joint offset block: column j is −R_eᵀ (ω_j × w + v_j).
        let dof = theta.len();
        let mut d_offset = na::DMatrix::zeros(3, dof);
        for (j, twist) in twists.iter().enumerate() {
            let v = na::Vector3::new(twist[0], twist[1], twist[2]);
            let omega = na::Vector3::new(twist[3], twist[4], twist[5]);
            let col = -(r_e_t * (omega.cross(&w) + v));
            d_offset.view_mut((0, j), (3, 1)).copy_from(&col);
        }

        // Extrinsic block: [∂x/∂t_e | ∂x/∂φ_e].
        let mut d_extrinsic = na::DMatrix::zeros(3, 6);
        d_extrinsic.view_mut((0, 0), (3, 3)).copy_from(&(-r_e_t));
        d_extrinsic.view_mut((0, 3), (3, 3)).copy_from(&skew(&x));

        // Landmark block.
        let d_landmark = na::DMatrix::from_iterator(3, 3, r_efp_t.iter().copied());

        let weight = 1.0 / self.sigma;
        let d_pixel_dyn = na::DMatrix::from_iterator(2, 3, d_pixel.iter().copied()) * weight;

        let residual = na::DVector::from_vec(vec![
            (pixel.x - self.pixel.x) * weight,
            (pixel.y - self.pixel.y) * weight,
        ]);

        Ok(Some(Linearization {
            keys: vec![
                VarKey::Pose(self.step),
                VarKey::JointOffset,
                VarKey::Extrinsic,
                VarKey::Landmark(self.landmark),
            ],
            jacobians: vec![
                &d_pixel_dyn * d_pose,
                &d_pixel_dyn * d_offset,
                &d_pixel_dyn * d_extrinsic,
                &d_pixel_dyn * d_landmark,
            ],
            residual,
        }))
    }
}

impl PriorFactor {
    fn linearize(&self, values: &Values) -> Result<Option<Linearization>, ModelError> {
        let current = values.pose(&self.key)?;

        let weight = 1.0 / self.sigma;
        // First-order: the Jacobian of the local difference w.r.t. the
        // retracted perturbation is identity near the anchor.
        let residual = na::DVector::from_iterator(6, self.pose.local(current).iter().copied())
            * weight;
        let jacobian = na::DMatrix::identity(6, 6) * weight;

        Ok(Some(Linearization {
            keys: vec![self.key],
            jacobians: vec![jacobian],
            residual,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::values::VarValue;
    use crate::pose::Pose;

    fn test_setup() -> (Values, KinematicModel, PinholeCamera) {
        let model = KinematicModel::default_6dof();
        let camera = PinholeCamera::new(520.0, 520.0, 320.0, 240.0);

        let mut values = Values::new();
        values.insert(VarKey::Pose(0), VarValue::Pose(Pose::identity()));
        values.insert(VarKey::JointOffset, VarValue::Vector(na::DVector::zeros(6)));
        values.insert(VarKey::Extrinsic, VarValue::Pose(Pose::identity()));

        // Place the landmark in front of the camera at the zero
        // configuration.
        let fk = model.forward(&na::DVector::zeros(6)).unwrap();
        let landmark = fk.transform_point(&na::Vector3::new(0.2, -0.1, 2.0));
        values.insert(VarKey::Landmark(0), VarValue::Point(landmark));

        (values, model, camera)
    }

    fn projection_factor(values: &Values, model: &KinematicModel, camera: &PinholeCamera) -> ProjectionFactor {
        // Measure the pixel at the ground-truth state so the residual is
        // zero there.
        let fk = model.forward(&na::DVector::zeros(6)).unwrap();
        let world_from_camera = &fk * values.pose(&VarKey::Extrinsic).unwrap();
        let x = world_from_camera
            .inverse_transform_point(values.point(&VarKey::Landmark(0)).unwrap());
        let pixel = camera.project(&x).unwrap();
        ProjectionFactor {
            step: 0,
            landmark: 0,
            commanded: na::DVector::zeros(6),
            pixel,
            sigma: 1.0,
        }
    }

    #[test]
    fn test_encoder_factor_residual() {
        let mut values = Values::new();
        values.insert(
            VarKey::JointOffset,
            VarValue::Vector(na::DVector::from_vec(vec![0.01, -0.02, 0.0, 0.0, 0.0, 0.03])),
        );

        let factor = Factor::Encoder(EncoderFactor {
            step: 0,
            commanded: na::DVector::zeros(6),
            measured: na::DVector::zeros(6),
            sigma: 0.1,
        });

        let model = KinematicModel::default_6dof();
        let camera = PinholeCamera::new(1.0, 1.0, 0.0, 0.0);
        let lin = factor.linearize(&values, &model, &camera).unwrap().unwrap();

        assert_eq!(lin.residual.len(), 6);
        assert!((lin.residual[0] - 0.1).abs() < 1e-12);
        assert!((lin.residual[1] + 0.2).abs() < 1e-12);
        assert!((lin.jacobians[0][(0, 0)] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_projection_factor_zero_residual_at_truth() {
        let (values, model, camera) = test_setup();
        let factor = projection_factor(&values, &model, &camera);
        let lin = Factor::Projection(factor)
            .linearize(&values, &model, &camera)
            .unwrap()
            .unwrap();
        assert!(lin.residual.norm() < 1e-10);
        assert_eq!(lin.jacobians.len(), 4);
        assert_eq!(lin.jacobians[0].shape(), (2, 6));
        assert_eq!(lin.jacobians[1].shape(), (2, 6));
        assert_eq!(lin.jacobians[2].shape(), (2, 6));
        assert_eq!(lin.jacobians[3].shape(), (2, 3));
    }

    #[test]
    fn test_projection_jacobians_match_finite_differences() {
        let (values, model, camera) = test_setup();
        let factor = projection_factor(&values, &model, &camera);
        let wrapped = Factor::Projection(factor);
        let lin = wrapped.linearize(&values, &model, &camera).unwrap().unwrap();

        let eps = 1e-6;
        for (block, key) in lin.keys.iter().enumerate() {
            let dof = values.get(key).unwrap().dof();
            for c in 0..dof {
                let mut plus = values.clone();
                let mut minus = values.clone();
                let mut delta = na::DVector::zeros(dof);
                delta[c] = eps;
                plus.apply_delta(key, delta.as_view()).unwrap();
                delta[c] = -eps;
                minus.apply_delta(key, delta.as_view()).unwrap();

                let lin_plus = wrapped.linearize(&plus, &model, &camera).unwrap().unwrap();
                let lin_minus = wrapped.linearize(&minus, &model, &camera).unwrap().unwrap();
                let fd = (&lin_plus.residual - &lin_minus.residual) / (2.0 * eps);
                for r in 0..2 {
                    assert!(
                        (fd[r] - lin.jacobians[block][(r, c)]).abs() < 1e-4,
                        "{key} block col {c} row {r}: fd {} vs analytic {}",
                        fd[r],
                        lin.jacobians[block][(r, c)]
                    );
                }
            }
        }
    }

    #[test]
    fn test_projection_factor_suppressed_when_invisible() {
        let (mut values, model, camera) = test_setup();
        let factor = projection_factor(&values, &model, &camera);

        // Move the landmark far behind the camera.
        let fk = model.forward(&na::DVector::zeros(6)).unwrap();
        let behind = fk.transform_point(&na::Vector3::new(0.0, 0.0, -3.0));
        values.insert(VarKey::Landmark(0), VarValue::Point(behind));

        let lin = Factor::Projection(factor)
            .linearize(&values, &model, &camera)
            .unwrap();
        assert!(lin.is_none());
    }

    #[test]
    fn test_prior_factor_zero_at_anchor() {
        let mut values = Values::new();
        let anchor = Pose::from_parts(
            na::Vector3::new(0.1, 0.2, 0.3),
            na::Vector3::new(0.0, 0.1, 0.0),
        );
        values.insert(VarKey::Pose(0), VarValue::Pose(anchor.clone()));

        let factor = Factor::Prior(PriorFactor {
            key: VarKey::Pose(0),
            pose: anchor,
            sigma: 0.01,
        });
        let model = KinematicModel::default_6dof();
        let camera = PinholeCamera::new(1.0, 1.0, 0.0, 0.0);
        let lin = factor.linearize(&values, &model, &camera).unwrap().unwrap();
        assert!(lin.residual.norm() < 1e-12);
    }
}
