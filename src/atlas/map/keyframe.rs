//! KeyFrame - A retained rig pose with its observations and graph links.
//!
//! KeyFrames are the nodes of the SLAM graph. They contain:
//! - Rig features over all cameras and their appearance vector
//! - Pose estimate (SE3, rig to world)
//! - Graph relationships (covisibility, spanning tree, loop edges)
//!
//! The covisibility graph connects KeyFrames that share MapPoint observations,
//! while the spanning tree and loop edges form the backbone of the essential
//! graph used for global correction.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::atlas::keyframe_db::BowVector;
use crate::geometry::SE3;
use crate::tracking::frame::Feature;

use super::erase_guard::EraseProtection;
use super::types::{KeyFrameId, MapPointId};

/// A KeyFrame in the SLAM map.
#[derive(Clone)]
pub struct KeyFrame {
    /// Unique, monotonically assigned identifier.
    pub id: KeyFrameId,

    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,

    /// Pose: transform from rig to world (T_wc).
    /// To transform a point from rig to world: p_world = pose.transform_point(p_rig)
    pub pose: SE3,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    /// Features of all rig cameras, indexed by feature slot.
    pub features: Vec<Feature>,

    /// Bag-of-Words appearance vector used for place recognition.
    pub bow_vector: BowVector,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// Feature slot → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected KeyFrame → number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    /// Covisible KeyFrames sorted by weight (best first), kept in sync with
    /// `covisibility_weights`.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree and Loop Edges
    // ─────────────────────────────────────────────────────────────────────────
    /// Parent KeyFrame in the spanning tree. None for the map origin.
    pub parent_id: Option<KeyFrameId>,

    /// Children KeyFrames in the spanning tree.
    pub children_ids: HashSet<KeyFrameId>,

    /// Permanent loop-closure edges. A keyframe with loop edges is never erased.
    loop_edges: HashSet<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────
    protection: EraseProtection,

    /// Erase was requested while the keyframe was protected.
    pub(crate) pending_erase: bool,

    /// Tombstone flag.
    pub is_bad: bool,
}

impl KeyFrame {
    pub fn new(
        id: KeyFrameId,
        timestamp_ns: u64,
        pose: SE3,
        features: Vec<Feature>,
        bow_vector: BowVector,
    ) -> Self {
        let num_features = features.len();
        Self {
            id,
            timestamp_ns,
            pose,
            features,
            bow_vector,
            map_point_ids: vec![None; num_features],
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            parent_id: None,
            children_ids: HashSet::new(),
            loop_edges: HashSet::new(),
            protection: EraseProtection::new(),
            pending_erase: false,
            is_bad: false,
        }
    }

    /// Rig origin in world frame.
    pub fn rig_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// World-to-rig transform (T_cw).
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn feature(&self, idx: usize) -> Option<&Feature> {
        self.features.get(idx)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the MapPoint ID for a given feature slot.
    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Associate a feature slot with a MapPoint.
    ///
    /// Returns the previous MapPoint ID if there was one.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    /// Remove the association for a feature slot.
    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// Slot of `mp_id` in this keyframe, if observed.
    pub fn slot_of(&self, mp_id: MapPointId) -> Option<usize> {
        self.map_point_ids.iter().position(|m| *m == Some(mp_id))
    }

    /// All associated (slot, MapPoint) pairs.
    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Add or update a covisibility connection.
    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.update_best_covisibles();
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.update_best_covisibles();
        }
    }

    /// Replace the whole adjacency list.
    pub(crate) fn set_covisibilities(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility_weights = weights;
        self.covisibility_weights.remove(&self.id);
        self.update_best_covisibles();
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// All covisible KeyFrames, best first.
    pub fn covisibles(&self) -> Vec<KeyFrameId> {
        self.ordered_covisibles.iter().map(|(id, _)| *id).collect()
    }

    /// The N best covisible KeyFrames (most shared points first).
    pub fn get_best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Covisible KeyFrames with at least `min_weight` shared points.
    pub fn get_covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    fn update_best_covisibles(&mut self) {
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        // Descending weight, ties by id for deterministic order.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree and Loop Edges
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }

    pub fn add_loop_edge(&mut self, kf_id: KeyFrameId) {
        if kf_id != self.id {
            self.loop_edges.insert(kf_id);
        }
    }

    pub fn loop_edges(&self) -> &HashSet<KeyFrameId> {
        &self.loop_edges
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    pub fn protection(&self) -> &EraseProtection {
        &self.protection
    }

    /// Whether local mapping may erase this keyframe right now.
    pub fn is_erasable(&self) -> bool {
        !self.protection.is_held() && self.loop_edges.is_empty()
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spatial Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Feature slots of `camera` within `radius` pixels of (u, v).
    ///
    /// Optionally filters by pyramid level (inclusive bounds).
    pub fn get_features_in_area(
        &self,
        camera: usize,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;

        self.features
            .iter()
            .enumerate()
            .filter(|(_, f)| f.camera == camera)
            .filter(|(_, f)| min_level.map_or(true, |min| f.octave >= min))
            .filter(|(_, f)| max_level.map_or(true, |max| f.octave <= max))
            .filter(|(_, f)| {
                let du = f.keypoint.x - u;
                let dv = f.keypoint.y - v;
                du * du + dv * dv <= radius_sq
            })
            .map(|(i, _)| i)
            .collect()
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent", &self.parent_id)
            .field("loop_edges", &self.loop_edges.len())
            .field("protected", &self.protection.is_held())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    fn create_keyframe_with_features(id: u64, num_features: usize) -> KeyFrame {
        let features = (0..num_features)
            .map(|i| {
                Feature::new(
                    i % 2,
                    Vector2::new(10.0 * i as f64, 20.0),
                    (i % 3) as i32,
                    [i as u8; 32],
                )
            })
            .collect();
        KeyFrame::new(KeyFrameId::new(id), 1_000_000 * id, SE3::identity(), features, BowVector::new())
    }

    #[test]
    fn test_map_point_association() {
        let mut kf = create_keyframe_with_features(1, 10);

        kf.set_map_point(3, MapPointId::new(100));
        assert_eq!(kf.get_map_point(3), Some(MapPointId::new(100)));
        assert_eq!(kf.get_map_point(4), None);
        assert_eq!(kf.slot_of(MapPointId::new(100)), Some(3));

        let prev = kf.set_map_point(3, MapPointId::new(200));
        assert_eq!(prev, Some(MapPointId::new(100)));

        assert_eq!(kf.erase_map_point(3), Some(MapPointId::new(200)));
        assert_eq!(kf.num_map_points(), 0);

        // Out-of-range slots are ignored.
        assert_eq!(kf.set_map_point(99, MapPointId::new(1)), None);
    }

    #[test]
    fn test_covisibility_ordering() {
        let mut kf = create_keyframe_with_features(1, 0);

        kf.add_covisibility(KeyFrameId::new(2), 50);
        kf.add_covisibility(KeyFrameId::new(3), 100);
        kf.add_covisibility(KeyFrameId::new(4), 25);
        kf.add_covisibility(KeyFrameId::new(1), 500); // self is ignored

        assert_eq!(
            kf.get_best_covisibles(2),
            vec![KeyFrameId::new(3), KeyFrameId::new(2)]
        );
        assert_eq!(kf.get_covisibles_above_weight(30).len(), 2);

        kf.erase_covisibility(KeyFrameId::new(3));
        assert_eq!(kf.covisibles()[0], KeyFrameId::new(2));
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(3)), 0);
    }

    #[test]
    fn test_loop_edges_block_erasure() {
        let mut kf = create_keyframe_with_features(5, 0);
        assert!(kf.is_erasable());

        kf.add_loop_edge(KeyFrameId::new(40));
        kf.add_loop_edge(KeyFrameId::new(5));
        assert_eq!(kf.loop_edges().len(), 1);
        assert!(!kf.is_erasable());
    }

    #[test]
    fn test_features_in_area_filters_camera_and_level() {
        let kf = create_keyframe_with_features(1, 6);

        // Slots on camera 0 are 0, 2, 4 at u = 0, 20, 40.
        let found = kf.get_features_in_area(0, 20.0, 20.0, 25.0, None, None);
        assert_eq!(found, vec![0, 2, 4]);

        let level_limited = kf.get_features_in_area(0, 20.0, 20.0, 25.0, Some(1), Some(2));
        assert_eq!(level_limited, vec![2, 4]);
    }
}
