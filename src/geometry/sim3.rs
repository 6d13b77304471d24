//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Monocular and multi-camera rigs without metric depth accumulate scale
//! drift, so loop correction works with similarity poses `S_iw` (world to
//! keyframe) and only converts back to rigid poses when committing.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use super::SE3;

/// 7-DOF similarity transformation.
///
/// Transforms points as: p' = s * R * p + t
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    /// Identity transformation (no rotation, no translation, scale = 1).
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self {
            rotation,
            translation,
            scale,
        }
    }

    /// Construct from rotation matrix, translation, and scale.
    pub fn from_rts(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
            scale,
        }
    }

    /// Lift a rigid transform to a similarity with scale 1.
    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Rigid transform [R | t/s] with the same rotation and the scale divided
    /// out of the translation.
    ///
    /// Applied to a corrected `S_iw` this yields the keyframe's new `T_iw`.
    pub fn to_rigid(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation / self.scale,
        }
    }

    /// Inverse transformation.
    ///
    /// S^{-1} = [(1/s)R^T | -(1/s)R^T*t]
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            translation: -(rot_inv * self.translation) * scale_inv,
            rotation: rot_inv,
            scale: scale_inv,
        }
    }

    /// Compose two Sim3 transforms: self ∘ other.
    ///
    /// [s1*R1 | t1] ∘ [s2*R2 | t2] = [s1*s2*R1*R2 | s1*R1*t2 + t1]
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    /// Transform a single point: p' = s * R * p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Rotation matrix (without scale).
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Tangent parameterization [rotation_vec (3), translation (3), log_scale (1)].
    pub fn log(&self) -> [f64; 7] {
        let rot_vec = self.rotation.scaled_axis();
        [
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.scale.ln(),
        ]
    }

    /// Inverse of [`Sim3::log`].
    pub fn exp(tangent: &[f64; 7]) -> Self {
        let rot_vec = Vector3::new(tangent[0], tangent[1], tangent[2]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(rot_vec),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
            scale: tangent[6].exp(),
        }
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl From<&SE3> for Sim3 {
    fn from(se3: &SE3) -> Self {
        Sim3::from_se3(se3)
    }
}
