//! Multi-camera rig model.
//!
//! A rig is a set of calibrated pinhole cameras rigidly mounted on a common
//! body ("rig") frame. Keyframe poses describe the rig; each camera carries
//! its own extrinsic `T_rig_cam`.

use nalgebra::{Vector2, Vector3};
use serde::Deserialize;

use crate::geometry::SE3;

/// Projection of rig-frame points into the cameras of a rig.
///
/// Loop verification, guided matching and fusion only ever need this
/// contract, so alternative camera models (fisheye, omnidirectional) can be
/// plugged in without touching the pipeline.
pub trait RigProjection: Send + Sync {
    /// Number of cameras mounted on the rig.
    fn num_cameras(&self) -> usize;

    /// Project a point given in rig coordinates into `camera`.
    ///
    /// Returns `None` when the point is behind the camera or falls outside
    /// the image bounds.
    fn project(&self, camera: usize, p_rig: &Vector3<f64>) -> Option<Vector2<f64>>;

    /// Like [`RigProjection::project`] without the image-bounds check; used
    /// for residuals, which must stay defined near the border.
    fn project_unbounded(&self, camera: usize, p_rig: &Vector3<f64>) -> Option<Vector2<f64>>;

    /// Depth of a rig-frame point along the optical axis of `camera`.
    fn depth(&self, camera: usize, p_rig: &Vector3<f64>) -> Option<f64>;
}

/// Pinhole intrinsics of a single camera.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PinholeIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

/// A pinhole camera and its mounting on the rig.
#[derive(Debug, Clone)]
pub struct PinholeCamera {
    pub intrinsics: PinholeIntrinsics,

    /// Camera-to-rig transform.
    pub t_rig_cam: SE3,

    /// Cached rig-to-camera transform.
    t_cam_rig: SE3,
}

impl PinholeCamera {
    pub fn new(intrinsics: PinholeIntrinsics, t_rig_cam: SE3) -> Self {
        let t_cam_rig = t_rig_cam.inverse();
        Self {
            intrinsics,
            t_rig_cam,
            t_cam_rig,
        }
    }

    /// Project a point in camera coordinates to pixels (no bounds check).
    pub fn project_camera_point(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let k = &self.intrinsics;
        Some(Vector2::new(
            k.fx * p_cam.x / p_cam.z + k.cx,
            k.fy * p_cam.y / p_cam.z + k.cy,
        ))
    }

    pub fn is_in_image(&self, uv: &Vector2<f64>) -> bool {
        let k = &self.intrinsics;
        uv.x >= 0.0 && uv.y >= 0.0 && uv.x < k.width as f64 && uv.y < k.height as f64
    }

    /// Rig-frame point expressed in this camera's frame.
    pub fn to_camera(&self, p_rig: &Vector3<f64>) -> Vector3<f64> {
        self.t_cam_rig.transform_point(p_rig)
    }
}

/// Rig of pinhole cameras.
#[derive(Debug, Clone)]
pub struct CameraRig {
    cameras: Vec<PinholeCamera>,
}

impl CameraRig {
    pub fn new(cameras: Vec<PinholeCamera>) -> Self {
        Self { cameras }
    }

    pub fn camera(&self, index: usize) -> Option<&PinholeCamera> {
        self.cameras.get(index)
    }

    pub fn cameras(&self) -> &[PinholeCamera] {
        &self.cameras
    }
}

impl RigProjection for CameraRig {
    fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    fn project(&self, camera: usize, p_rig: &Vector3<f64>) -> Option<Vector2<f64>> {
        let cam = self.cameras.get(camera)?;
        let uv = cam.project_camera_point(&cam.to_camera(p_rig))?;
        cam.is_in_image(&uv).then_some(uv)
    }

    fn project_unbounded(&self, camera: usize, p_rig: &Vector3<f64>) -> Option<Vector2<f64>> {
        let cam = self.cameras.get(camera)?;
        cam.project_camera_point(&cam.to_camera(p_rig))
    }

    fn depth(&self, camera: usize, p_rig: &Vector3<f64>) -> Option<f64> {
        let cam = self.cameras.get(camera)?;
        let z = cam.to_camera(p_rig).z;
        (z > 0.0).then_some(z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn intrinsics() -> PinholeIntrinsics {
        PinholeIntrinsics {
            fx: 400.0,
            fy: 400.0,
            cx: 320.0,
            cy: 240.0,
            width: 640,
            height: 480,
        }
    }

    #[test]
    fn test_project_principal_point() {
        let rig = CameraRig::new(vec![PinholeCamera::new(intrinsics(), SE3::identity())]);
        let uv = rig.project(0, &Vector3::new(0.0, 0.0, 5.0)).unwrap();
        assert_relative_eq!(uv, Vector2::new(320.0, 240.0), epsilon = 1e-12);
    }

    #[test]
    fn test_backward_camera_sees_points_behind_rig() {
        // Second camera looks along -z of the rig (180° about y).
        let back = SE3::from_scaled_axis(
            Vector3::new(0.0, std::f64::consts::PI, 0.0),
            Vector3::zeros(),
        );
        let rig = CameraRig::new(vec![
            PinholeCamera::new(intrinsics(), SE3::identity()),
            PinholeCamera::new(intrinsics(), back),
        ]);

        let behind = Vector3::new(0.0, 0.0, -4.0);
        assert!(rig.project(0, &behind).is_none());
        assert!(rig.project(1, &behind).is_some());
        assert_relative_eq!(rig.depth(1, &behind).unwrap(), 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_out_of_image_rejected() {
        let rig = CameraRig::new(vec![PinholeCamera::new(intrinsics(), SE3::identity())]);
        assert!(rig.project(0, &Vector3::new(100.0, 0.0, 1.0)).is_none());
        assert!(rig.project_unbounded(0, &Vector3::new(100.0, 0.0, 1.0)).is_some());
        assert!(rig.project(3, &Vector3::new(0.0, 0.0, 1.0)).is_none());
    }
}
