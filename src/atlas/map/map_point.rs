//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! Besides its position and observations, a MapPoint carries the
//! bookkeeping loop closing needs: a redirect to the landmark it was merged
//! into, and per-event tags that make gathering and correction idempotent
//! when a landmark is reachable from several keyframes.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::tracking::frame::Descriptor;

use super::types::{KeyFrameId, MapPointId};

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative descriptor (the most distinctive observation).
    pub descriptor: Descriptor,

    /// observations[kf_id] = feature slot of this point in that KeyFrame.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance bounds.
    pub min_distance: f64,
    pub max_distance: f64,

    pub visible_count: u32,
    pub found_count: u32,

    /// KeyFrame the point's scale statistics are referenced to.
    pub reference_kf: KeyFrameId,

    pub is_bad: bool,

    /// Survivor this point was merged into. Follow with
    /// [`super::Map::resolve_map_point`].
    pub replaced_by: Option<MapPointId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Loop-closing bookkeeping
    // ─────────────────────────────────────────────────────────────────────────
    /// Keyframe whose loop pass last gathered this point as a loop landmark.
    pub loop_point_for_kf: Option<KeyFrameId>,

    /// Keyframe whose loop correction last moved this point.
    pub corrected_by_kf: Option<KeyFrameId>,

    /// Window keyframe whose pose pair was used for that correction.
    pub corrected_reference: Option<KeyFrameId>,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        reference_kf: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 1,
            found_count: 1,
            reference_kf,
            is_bad: false,
            replaced_by: None,
            loop_point_for_kf: None,
            corrected_by_kf: None,
            corrected_reference: None,
        }
    }

    /// Record an observation. A KeyFrame observes a point at most once, so an
    /// existing entry is left untouched.
    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> bool {
        if self.observations.contains_key(&kf_id) {
            return false;
        }
        self.observations.insert(kf_id, feature_idx);
        true
    }

    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= 0.8 * self.min_distance && distance <= 1.2 * self.max_distance
    }

    /// Predicted pyramid level at which the point appears from `distance`.
    pub fn predict_scale(&self, distance: f64, scale_factor: f64, num_levels: u32) -> i32 {
        if distance <= 0.0 {
            return 0;
        }
        let ratio = self.max_distance / distance;
        let level = (ratio.ln() / scale_factor.ln()).ceil() as i32;
        level.clamp(0, num_levels as i32 - 1)
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("replaced_by", &self.replaced_by)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_mappoint() -> MapPoint {
        MapPoint::new(
            MapPointId::new(1),
            Vector3::new(1.0, 2.0, 3.0),
            [0u8; 32],
            KeyFrameId::new(0),
        )
    }

    #[test]
    fn test_observation_added_once_per_keyframe() {
        let mut mp = create_test_mappoint();

        assert!(mp.add_observation(KeyFrameId::new(1), 5));
        assert!(!mp.add_observation(KeyFrameId::new(1), 9));
        assert!(mp.add_observation(KeyFrameId::new(2), 10));

        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.observations.get(&KeyFrameId::new(1)), Some(&5));

        assert!(mp.erase_observation(KeyFrameId::new(1)));
        assert!(!mp.erase_observation(KeyFrameId::new(1)));
    }

    #[test]
    fn test_predict_scale() {
        let mut mp = create_test_mappoint();
        mp.max_distance = 1.2f64.powi(3) * 2.0;
        mp.min_distance = mp.max_distance / 1.2f64.powi(7);

        assert_eq!(mp.predict_scale(mp.max_distance, 1.2, 8), 0);
        assert_eq!(mp.predict_scale(2.1, 1.2, 8), 3);
        assert_eq!(mp.predict_scale(1e-3, 1.2, 8), 7);
    }
}
