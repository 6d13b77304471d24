//! Synthetic scenes for loop-closing tests and the demo binary.
//!
//! A two-camera rig (forward and backward looking) moves through a world of
//! landmark patches. Each physical landmark has its own random descriptor
//! and its own visual word, so appearance and descriptor matching behave
//! like an ideal front-end.
//!
//! The revisit scene has three segments:
//! - `early`: keyframes 0..=6 around the origin
//! - `away`: keyframes far from the origin, each seeing its own patches
//! - `revisit`: keyframes at the early poses 1..=6, observed through a
//!   drifted similarity, with duplicate landmarks created by "tracking"

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{UnitQuaternion, Vector3};
use rand::prelude::*;
use rand::rngs::StdRng;

use crate::atlas::keyframe_db::BowVector;
use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::{Sim3, SE3};
use crate::tracking::frame::{CameraRig, Descriptor, Feature, PinholeCamera, PinholeIntrinsics, RigProjection};

pub const EARLY_KEYFRAMES: usize = 7;
pub const AWAY_KEYFRAMES: usize = 9;
pub const REVISIT_KEYFRAMES: usize = 6;

const STEP: f64 = 0.15;
const AWAY_OFFSET: f64 = 40.0;
const AWAY_STEP: f64 = 25.0;
const PLACE_WORD: u32 = 1_000_000;

pub fn two_camera_rig() -> Arc<CameraRig> {
    let intrinsics = PinholeIntrinsics {
        fx: 400.0,
        fy: 400.0,
        cx: 320.0,
        cy: 240.0,
        width: 640,
        height: 480,
    };
    let back = SE3::from_scaled_axis(Vector3::new(0.0, std::f64::consts::PI, 0.0), Vector3::zeros());
    Arc::new(CameraRig::new(vec![
        PinholeCamera::new(intrinsics, SE3::identity()),
        PinholeCamera::new(intrinsics, back),
    ]))
}

/// Drift accumulated by the time the rig returns.
pub fn revisit_drift() -> Sim3 {
    Sim3::new(
        UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.04, 0.01)),
        Vector3::new(0.3, -0.05, 0.2),
        1.08,
    )
}

pub struct Scene {
    pub map: Map,
    pub rig: Arc<CameraRig>,
    pub early: Vec<KeyFrameId>,
    pub away: Vec<KeyFrameId>,
    pub revisit: Vec<KeyFrameId>,
    /// Ground-truth rig-to-world poses.
    pub true_poses: HashMap<KeyFrameId, SE3>,
    /// Landmarks created by the revisit segment.
    pub revisit_points: Vec<MapPointId>,
}

struct SceneBuilder {
    map: Map,
    rig: Arc<CameraRig>,
    rng: StdRng,
    /// Physical landmark positions and descriptors.
    landmarks: Vec<(Vector3<f64>, Descriptor)>,
    true_poses: HashMap<KeyFrameId, SE3>,
}

impl SceneBuilder {
    fn new() -> Self {
        Self {
            map: Map::new(),
            rig: two_camera_rig(),
            rng: StdRng::seed_from_u64(42),
            landmarks: Vec::new(),
            true_poses: HashMap::new(),
        }
    }

    /// Front and back grids of landmarks centred on `center`.
    fn add_patches(&mut self, center: Vector3<f64>) -> Vec<usize> {
        let mut ids = Vec::new();
        for z in [7.0, -7.0] {
            for row in 0..6 {
                for col in 0..8 {
                    let p = center
                        + Vector3::new(
                            -2.8 + 0.8 * col as f64,
                            -2.0 + 0.8 * row as f64,
                            z + 0.3 * ((row + col) % 3) as f64,
                        );
                    let mut descriptor = [0u8; 32];
                    self.rng.fill(&mut descriptor[..]);
                    ids.push(self.landmarks.len());
                    self.landmarks.push((p, descriptor));
                }
            }
        }
        ids
    }

    /// Insert a keyframe at `true_pose`, observed through `drift`.
    ///
    /// Landmarks are looked up in (or added to) `instances`, so segments
    /// with separate tables create duplicate map points for one physical
    /// landmark.
    fn add_keyframe(
        &mut self,
        true_pose: &SE3,
        drift: &Sim3,
        visible: &[usize],
        instances: &mut HashMap<usize, MapPointId>,
        place: u32,
    ) -> KeyFrameId {
        let t_cw = true_pose.inverse();
        let mut features = Vec::new();
        let mut observed = Vec::new();
        let mut bow = BowVector::new();
        for &phys in visible {
            let (p, descriptor) = self.landmarks[phys];
            let p_rig = t_cw.transform_point(&p);
            for cam in 0..self.rig.num_cameras() {
                if let Some(uv) = self.rig.project(cam, &p_rig) {
                    observed.push((features.len(), phys));
                    features.push(Feature::new(cam, uv, 0, descriptor));
                    bow.insert(phys as u32, 1.0);
                    break;
                }
            }
        }
        bow.insert(PLACE_WORD + place, 1.0);

        let drifted = SE3 {
            rotation: drift.rotation * true_pose.rotation,
            translation: drift.transform_point(&true_pose.translation),
        };
        let kf = self.map.create_keyframe(0, drifted, features, bow);
        self.true_poses.insert(kf, true_pose.clone());

        for (slot, phys) in observed {
            let mp = match instances.get(&phys) {
                Some(mp) => *mp,
                None => {
                    let (p, descriptor) = self.landmarks[phys];
                    let mp = self.map.create_map_point(drift.transform_point(&p), descriptor, kf);
                    instances.insert(phys, mp);
                    mp
                }
            };
            self.map.associate(kf, slot, mp);
        }
        self.map.update_connections(kf);
        kf
    }

    fn finish(mut self) -> (Map, Arc<CameraRig>, HashMap<KeyFrameId, SE3>) {
        let ids: Vec<MapPointId> = self.map.map_points().map(|mp| mp.id).collect();
        for mp in ids {
            self.map.update_map_point_normal_and_depth(mp);
        }
        (self.map, self.rig, self.true_poses)
    }
}

fn early_pose(k: usize) -> SE3 {
    SE3::from_rt(nalgebra::Matrix3::identity(), Vector3::new(STEP * k as f64, 0.0, 0.0))
}

/// Early segment, trip away, return to the early poses under drift.
pub fn revisit_scene() -> Scene {
    let mut b = SceneBuilder::new();
    let home = b.add_patches(Vector3::zeros());

    let mut early_instances = HashMap::new();
    let early: Vec<KeyFrameId> = (0..EARLY_KEYFRAMES)
        .map(|k| b.add_keyframe(&early_pose(k), &Sim3::identity(), &home, &mut early_instances, k as u32))
        .collect();

    let away: Vec<KeyFrameId> = (0..AWAY_KEYFRAMES)
        .map(|j| {
            let center = Vector3::new(AWAY_OFFSET + AWAY_STEP * j as f64, 0.0, 0.0);
            let patches = b.add_patches(center);
            let pose = SE3::from_rt(nalgebra::Matrix3::identity(), center);
            b.add_keyframe(&pose, &Sim3::identity(), &patches, &mut HashMap::new(), 100 + j as u32)
        })
        .collect();

    let drift = revisit_drift();
    let mut revisit_instances = HashMap::new();
    let revisit: Vec<KeyFrameId> = (1..=REVISIT_KEYFRAMES)
        .map(|k| b.add_keyframe(&early_pose(k), &drift, &home, &mut revisit_instances, k as u32))
        .collect();
    let mut revisit_points: Vec<MapPointId> = revisit_instances.values().copied().collect();
    revisit_points.sort();

    let (map, rig, true_poses) = b.finish();
    Scene {
        map,
        rig,
        early,
        away,
        revisit,
        true_poses,
        revisit_points,
    }
}

/// `n` keyframes, each at a place never seen before.
pub fn straight_scene(n: usize) -> Scene {
    let mut b = SceneBuilder::new();
    let away: Vec<KeyFrameId> = (0..n)
        .map(|j| {
            let center = Vector3::new(AWAY_STEP * j as f64, 0.0, 0.0);
            let patches = b.add_patches(center);
            let pose = SE3::from_rt(nalgebra::Matrix3::identity(), center);
            b.add_keyframe(&pose, &Sim3::identity(), &patches, &mut HashMap::new(), j as u32)
        })
        .collect();

    let (map, rig, true_poses) = b.finish();
    Scene {
        map,
        rig,
        early: Vec::new(),
        away,
        revisit: Vec::new(),
        true_poses,
        revisit_points: Vec::new(),
    }
}

/// Rigid-pose distance: translation error and rotation angle.
pub fn pose_error(a: &SE3, b: &SE3) -> (f64, f64) {
    (
        (a.translation - b.translation).norm(),
        a.rotation.angle_to(&b.rotation),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revisit_scene_layout() {
        let scene = revisit_scene();
        let map = &scene.map;
        assert_eq!(map.num_keyframes(), EARLY_KEYFRAMES + AWAY_KEYFRAMES + REVISIT_KEYFRAMES);

        // Early keyframes see each other; the revisit segment has its own landmarks.
        let kf1 = map.get_keyframe(scene.early[1]).unwrap();
        assert!(kf1.get_covisibility_weight(scene.early[2]) >= 15);
        assert_eq!(kf1.get_covisibility_weight(scene.revisit[0]), 0);
        assert!(map.get_keyframe(scene.away[0]).unwrap().covisibles().is_empty());

        // Same physical view, same features.
        let e = map.get_keyframe(scene.early[3]).unwrap();
        let r = map.get_keyframe(scene.revisit[2]).unwrap();
        assert_eq!(e.num_features(), r.num_features());
        assert!(e.num_map_points() >= 60);
        assert!(e.features.iter().any(|f| f.camera == 1));
    }
}
