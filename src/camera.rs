//! Pinhole projection model.
//!
//! Projects camera-frame 3-D points to pixels and supplies the 2×3 point
//! Jacobian the projection factor chains with its pose and kinematic
//! blocks. Visibility failures are expected and recoverable: callers treat
//! them as "no factor generated", never as a hard error.

use nalgebra as na;
use thiserror::Error;

/// Minimum depth accepted in front of the camera.
const MIN_DEPTH: f64 = 1e-6;

/// Point not visible from the camera. Recoverable by contract.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProjectionError {
    #[error("point at depth {depth:.4} is behind the camera")]
    BehindCamera { depth: f64 },

    #[error("pixel ({u:.1}, {v:.1}) falls outside the image bounds")]
    OutOfView { u: f64, v: f64 },
}

/// Pinhole camera intrinsics, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    bounds: Option<(f64, f64)>,
}

impl PinholeCamera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            bounds: None,
        }
    }

    /// Enable field-of-view checking against an image of `width` × `height`
    /// pixels.
    pub fn with_bounds(mut self, width: f64, height: f64) -> Self {
        self.bounds = Some((width, height));
        self
    }

    /// Project a camera-frame point to a pixel.
    pub fn project(&self, point: &na::Vector3<f64>) -> Result<na::Vector2<f64>, ProjectionError> {
        if point.z < MIN_DEPTH {
            return Err(ProjectionError::BehindCamera { depth: point.z });
        }

        let u = self.fx * point.x / point.z + self.cx;
        let v = self.fy * point.y / point.z + self.cy;

        if let Some((width, height)) = self.bounds {
            if u < 0.0 || u >= width || v < 0.0 || v >= height {
                return Err(ProjectionError::OutOfView { u, v });
            }
        }

        Ok(na::Vector2::new(u, v))
    }

    /// Project a camera-frame point and return the Jacobian of the pixel
    /// with respect to the point.
    pub fn project_with_jacobian(
        &self,
        point: &na::Vector3<f64>,
    ) -> Result<(na::Vector2<f64>, na::Matrix2x3<f64>), ProjectionError> {
        let pixel = self.project(point)?;

        let z_inv = 1.0 / point.z;
        let z_inv2 = z_inv * z_inv;
        let jacobian = na::Matrix2x3::new(
            self.fx * z_inv,
            0.0,
            -self.fx * point.x * z_inv2,
            0.0,
            self.fy * z_inv,
            -self.fy * point.y * z_inv2,
        );

        Ok((pixel, jacobian))
    }

    /// Camera-frame point on the viewing ray of `pixel` at the given depth.
    pub fn back_project(&self, pixel: &na::Vector2<f64>, depth: f64) -> na::Vector3<f64> {
        na::Vector3::new(
            (pixel.x - self.cx) / self.fx * depth,
            (pixel.y - self.cy) / self.fy * depth,
            depth,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vga_camera() -> PinholeCamera {
        PinholeCamera::new(520.0, 520.0, 320.0, 240.0).with_bounds(640.0, 480.0)
    }

    #[test]
    fn test_principal_ray_hits_principal_point() {
        let camera = vga_camera();
        let pixel = camera.project(&na::Vector3::new(0.0, 0.0, 2.0)).unwrap();
        assert!((pixel - na::Vector2::new(320.0, 240.0)).norm() < 1e-12);
    }

    #[test]
    fn test_point_behind_camera_rejected() {
        let camera = vga_camera();
        let err = camera
            .project(&na::Vector3::new(0.1, 0.1, -1.0))
            .unwrap_err();
        assert!(matches!(err, ProjectionError::BehindCamera { .. }));
    }

    #[test]
    fn test_point_outside_bounds_rejected() {
        let camera = vga_camera();
        let err = camera.project(&na::Vector3::new(5.0, 0.0, 1.0)).unwrap_err();
        assert!(matches!(err, ProjectionError::OutOfView { .. }));
    }

    #[test]
    fn test_jacobian_matches_finite_differences() {
        let camera = vga_camera();
        let point = na::Vector3::new(0.3, -0.2, 2.5);
        let (pixel, jacobian) = camera.project_with_jacobian(&point).unwrap();

        let eps = 1e-7;
        for c in 0..3 {
            let mut perturbed = point;
            perturbed[c] += eps;
            let pixel_plus = camera.project(&perturbed).unwrap();
            let fd = (pixel_plus - pixel) / eps;
            for r in 0..2 {
                assert!(
                    (fd[r] - jacobian[(r, c)]).abs() < 1e-4,
                    "({r}, {c}): fd {} vs analytic {}",
                    fd[r],
                    jacobian[(r, c)]
                );
            }
        }
    }

    #[test]
    fn test_back_project_round_trip() {
        let camera = vga_camera();
        let point = na::Vector3::new(0.4, 0.1, 1.8);
        let pixel = camera.project(&point).unwrap();
        let back = camera.back_project(&pixel, point.z);
        assert!((back - point).norm() < 1e-10);
    }
}
