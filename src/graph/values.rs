//! Typed variable store for the estimation problem.
//!
//! Variables are keyed by an explicit (category, index) pair instead of a
//! runtime-typed symbol dictionary; the typed accessors fail with
//! [`ModelError::KeyMismatch`] on a category mismatch rather than relying
//! on a cast.

use std::collections::HashMap;

use nalgebra as na;

use crate::error::ModelError;
use crate::pose::{Pose, Vector6};

/// Unique key of an unknown in the estimation problem.
///
/// Key uniqueness is a hard invariant of the graph: the same key is never
/// created twice (see `CalibrationGraph::add_variable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VarKey {
    /// The global joint-angle-offset vector (one per run).
    JointOffset,
    /// The global camera-to-end-effector extrinsic (one per run).
    Extrinsic,
    /// Robot base pose at a time step.
    Pose(usize),
    /// A landmark position, created lazily on first observation.
    Landmark(u64),
}

impl std::fmt::Display for VarKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarKey::JointOffset => write!(f, "joint_offset"),
            VarKey::Extrinsic => write!(f, "extrinsic"),
            VarKey::Pose(step) => write!(f, "pose({step})"),
            VarKey::Landmark(id) => write!(f, "landmark({id})"),
        }
    }
}

/// Value of a variable: a closed set of categories.
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Pose(Pose),
    Vector(na::DVector<f64>),
    Point(na::Vector3<f64>),
}

impl VarValue {
    /// Tangent-space dimension of the value.
    pub fn dof(&self) -> usize {
        match self {
            VarValue::Pose(_) => Pose::DOF,
            VarValue::Vector(v) => v.len(),
            VarValue::Point(_) => 3,
        }
    }

    /// Apply a tangent-space perturbation. Poses are renormalized by the
    /// retraction; vectors and points are translated.
    pub fn retract(&self, delta: na::DVectorView<'_, f64>) -> VarValue {
        match self {
            VarValue::Pose(pose) => {
                let d = Vector6::new(delta[0], delta[1], delta[2], delta[3], delta[4], delta[5]);
                VarValue::Pose(pose.retract(&d))
            }
            VarValue::Vector(v) => {
                let mut updated = v.clone();
                for i in 0..updated.len() {
                    updated[i] += delta[i];
                }
                VarValue::Vector(updated)
            }
            VarValue::Point(p) => {
                VarValue::Point(p + na::Vector3::new(delta[0], delta[1], delta[2]))
            }
        }
    }
}

/// A mapping from variable keys to current values (an "estimate").
///
/// Three parallel instances exist at any time: the simulator-only ground
/// truth, the frozen per-step initial seeds, and the current estimate the
/// optimizer updates in place.
#[derive(Debug, Clone, Default)]
pub struct Values {
    map: HashMap<VarKey, VarValue>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: VarKey, value: VarValue) {
        self.map.insert(key, value);
    }

    pub fn contains(&self, key: &VarKey) -> bool {
        self.map.contains_key(key)
    }

    pub fn get(&self, key: &VarKey) -> Option<&VarValue> {
        self.map.get(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &VarKey> {
        self.map.keys()
    }

    /// Typed access to a pose variable.
    pub fn pose(&self, key: &VarKey) -> Result<&Pose, ModelError> {
        match self.map.get(key) {
            Some(VarValue::Pose(pose)) => Ok(pose),
            Some(_) => Err(ModelError::KeyMismatch {
                key: key.to_string(),
            }),
            None => Err(ModelError::MissingVariable {
                key: key.to_string(),
            }),
        }
    }

    /// Typed access to a vector variable.
    pub fn vector(&self, key: &VarKey) -> Result<&na::DVector<f64>, ModelError> {
        match self.map.get(key) {
            Some(VarValue::Vector(v)) => Ok(v),
            Some(_) => Err(ModelError::KeyMismatch {
                key: key.to_string(),
            }),
            None => Err(ModelError::MissingVariable {
                key: key.to_string(),
            }),
        }
    }

    /// Typed access to a point variable.
    pub fn point(&self, key: &VarKey) -> Result<&na::Vector3<f64>, ModelError> {
        match self.map.get(key) {
            Some(VarValue::Point(p)) => Ok(p),
            Some(_) => Err(ModelError::KeyMismatch {
                key: key.to_string(),
            }),
            None => Err(ModelError::MissingVariable {
                key: key.to_string(),
            }),
        }
    }

    /// Retract the variable at `key` by `delta`, in place.
    pub fn apply_delta(
        &mut self,
        key: &VarKey,
        delta: na::DVectorView<'_, f64>,
    ) -> Result<(), ModelError> {
        let value = self.map.get(key).ok_or_else(|| ModelError::MissingVariable {
            key: key.to_string(),
        })?;
        let updated = value.retract(delta);
        self.map.insert(*key, updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access_mismatch() {
        let mut values = Values::new();
        values.insert(VarKey::JointOffset, VarValue::Vector(na::DVector::zeros(6)));

        let err = values.pose(&VarKey::JointOffset).unwrap_err();
        assert!(matches!(err, ModelError::KeyMismatch { .. }));

        let err = values.point(&VarKey::JointOffset).unwrap_err();
        assert!(matches!(err, ModelError::KeyMismatch { .. }));

        assert!(values.vector(&VarKey::JointOffset).is_ok());
    }

    #[test]
    fn test_missing_variable() {
        let values = Values::new();
        let err = values.pose(&VarKey::Pose(3)).unwrap_err();
        assert_eq!(
            err,
            ModelError::MissingVariable {
                key: "pose(3)".to_string()
            }
        );
    }

    #[test]
    fn test_apply_delta_point() {
        let mut values = Values::new();
        values.insert(
            VarKey::Landmark(7),
            VarValue::Point(na::Vector3::new(1.0, 2.0, 3.0)),
        );

        let delta = na::DVector::from_vec(vec![0.1, -0.2, 0.3]);
        values
            .apply_delta(&VarKey::Landmark(7), delta.as_view())
            .unwrap();

        let point = values.point(&VarKey::Landmark(7)).unwrap();
        assert!((point - na::Vector3::new(1.1, 1.8, 3.3)).norm() < 1e-12);
    }

    #[test]
    fn test_key_ordering_is_deterministic() {
        let mut keys = vec![
            VarKey::Landmark(2),
            VarKey::Pose(1),
            VarKey::JointOffset,
            VarKey::Landmark(0),
            VarKey::Extrinsic,
            VarKey::Pose(0),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                VarKey::JointOffset,
                VarKey::Extrinsic,
                VarKey::Pose(0),
                VarKey::Pose(1),
                VarKey::Landmark(0),
                VarKey::Landmark(2),
            ]
        );
    }
}
