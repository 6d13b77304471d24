//! Map - Arena owning KeyFrames and MapPoints.
//!
//! The Map is the central data structure that holds the SLAM graph:
//! - KeyFrames with their poses and features
//! - MapPoints (3D landmarks) with their observations
//! - Covisibility, spanning-tree and loop relationships between KeyFrames
//!
//! It provides methods for:
//! - Creating KeyFrames/MapPoints and bidirectional associations (KF↔MP)
//! - Recomputing covisibility edges from shared observations
//! - Merging duplicate landmarks (redirect + tombstone)
//! - Erase protection leases and deferred keyframe erasure

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;

use crate::atlas::keyframe_db::BowVector;
use crate::geometry::SE3;
use crate::tracking::frame::{descriptor_distance, Descriptor, Feature};

use super::erase_guard::{ErasureLease, LeaseLedger};
use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Minimum shared landmarks for a covisibility edge to be kept.
const MIN_CONNECTION_WEIGHT: usize = 15;

/// The SLAM map containing KeyFrames and MapPoints.
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    next_kf_id: u64,
    next_mp_id: u64,

    /// First KeyFrame created; root of the spanning tree, never erased.
    origin_kf_id: Option<KeyFrameId>,

    /// Pyramid scale factor between levels (typically 1.2).
    scale_factor: f64,

    /// Number of pyramid levels (typically 8).
    num_levels: u32,

    lease_ledger: Arc<LeaseLedger>,

    /// Keyframes whose erasure waits for their lease to be released.
    pending_erasures: HashSet<KeyFrameId>,

    /// survivor -> tombstoned landmarks whose `replaced_by` points at it.
    redirects_to: HashMap<MapPointId, Vec<MapPointId>>,

    /// Incremented once per loop correction that reshaped the map.
    optimization_epoch: u64,
    last_optimized_by: Option<KeyFrameId>,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            origin_kf_id: None,
            scale_factor: 1.2,
            num_levels: 8,
            lease_ledger: Arc::new(LeaseLedger::default()),
            pending_erasures: HashSet::new(),
            redirects_to: HashMap::new(),
            optimization_epoch: 0,
            last_optimized_by: None,
        }
    }

    /// Create a new Map with custom pyramid parameters.
    pub fn with_pyramid(scale_factor: f64, num_levels: u32) -> Self {
        Self {
            scale_factor,
            num_levels,
            ..Self::new()
        }
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn num_levels(&self) -> u32 {
        self.num_levels
    }

    /// Scale of pyramid level `octave` relative to level 0.
    pub fn level_scale(&self, octave: i32) -> f64 {
        self.scale_factor.powi(octave)
    }

    /// Variance of a keypoint detected at `octave`.
    pub fn level_sigma2(&self, octave: i32) -> f64 {
        self.scale_factor.powi(2 * octave)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create and add a new KeyFrame. Ids are assigned monotonically.
    pub fn create_keyframe(
        &mut self,
        timestamp_ns: u64,
        pose: SE3,
        features: Vec<Feature>,
        bow_vector: BowVector,
    ) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;

        self.keyframes
            .insert(id, KeyFrame::new(id, timestamp_ns, pose, features, bow_vector));
        if self.origin_kf_id.is_none() {
            self.origin_kf_id = Some(id);
        }
        id
    }

    pub fn origin_keyframe_id(&self) -> Option<KeyFrameId> {
        self.origin_kf_id
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    /// Non-bad KeyFrame, if present.
    pub fn good_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id).filter(|kf| !kf.is_bad)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    /// Ids of all non-bad KeyFrames in creation order.
    pub fn all_keyframes(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<KeyFrameId> = self
            .keyframes
            .values()
            .filter(|kf| !kf.is_bad)
            .map(|kf| kf.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        reference_kf: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, reference_kf));
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    /// Non-bad MapPoint, if present.
    pub fn good_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id).filter(|mp| !mp.is_bad)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Follow `replaced_by` redirects to the surviving landmark.
    pub fn resolve_map_point(&self, id: MapPointId) -> MapPointId {
        let mut current = id;
        // Chains are flattened on every merge, so this loop is short; the
        // bound guards against a corrupted cycle.
        for _ in 0..self.map_points.len().max(1) {
            match self.map_points.get(&current).and_then(|mp| mp.replaced_by) {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame slot and a MapPoint.
    ///
    /// Covisibility is not touched; call [`Map::update_connections`] once the
    /// KeyFrame's observations are in place.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let slot_ok = self
            .keyframes
            .get(&kf_id)
            .map_or(false, |kf| feature_idx < kf.num_features());
        if !slot_ok || !self.map_points.contains_key(&mp_id) {
            return false;
        }

        let added = self
            .map_points
            .get_mut(&mp_id)
            .map_or(false, |mp| mp.add_observation(kf_id, feature_idx));
        if !added {
            return false;
        }

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }
        true
    }

    /// Remove the association of a KeyFrame slot. Returns the detached MapPoint.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get_mut(&kf_id)?.erase_map_point(feature_idx)?;
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id);
        }
        Some(mp_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Graph Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Recompute the covisibility edges of `kf_id` from shared observations.
    ///
    /// Edges with at least 15 shared landmarks are kept; if none qualifies the
    /// single strongest edge is kept. Edges are mirrored into the neighbours.
    /// A KeyFrame without a spanning-tree parent (other than the origin) is
    /// attached to its strongest neighbour.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };

        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, mp_id) in kf.get_map_point_indices() {
            let Some(mp) = self.good_map_point(mp_id) else {
                continue;
            };
            for &other in mp.observations.keys() {
                if other != kf_id {
                    *counter.entry(other).or_insert(0) += 1;
                }
            }
        }
        counter.retain(|id, _| self.keyframes.get(id).map_or(false, |k| !k.is_bad));

        if counter.is_empty() {
            return;
        }

        let mut kept: HashMap<KeyFrameId, usize> = counter
            .iter()
            .filter(|(_, &w)| w >= MIN_CONNECTION_WEIGHT)
            .map(|(&id, &w)| (id, w))
            .collect();
        if kept.is_empty() {
            if let Some((&best, &w)) = counter.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0))) {
                kept.insert(best, w);
            }
        }

        let previous: Vec<KeyFrameId> = kf.covisibility_weights().keys().copied().collect();

        for old in previous {
            if !kept.contains_key(&old) {
                if let Some(other) = self.keyframes.get_mut(&old) {
                    other.erase_covisibility(kf_id);
                }
            }
        }
        for (&other_id, &w) in &kept {
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.add_covisibility(kf_id, w);
            }
        }

        let is_origin = self.origin_kf_id == Some(kf_id);
        let Some(kf) = self.keyframes.get_mut(&kf_id) else {
            return;
        };
        kf.set_covisibilities(kept);

        if kf.parent_id.is_none() && !is_origin {
            if let Some(&parent) = kf.get_best_covisibles(1).first() {
                kf.set_parent(parent);
                if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                    parent_kf.add_child(kf_id);
                }
            }
        }
    }

    /// Add a permanent, symmetric loop edge.
    pub fn add_loop_edge(&mut self, a: KeyFrameId, b: KeyFrameId) {
        if let Some(kf) = self.keyframes.get_mut(&a) {
            kf.add_loop_edge(b);
        }
        if let Some(kf) = self.keyframes.get_mut(&b) {
            kf.add_loop_edge(a);
        }
    }

    /// Merge landmark `old` into `new`.
    ///
    /// Every KeyFrame observing `old` is redirected to `new` unless it already
    /// observes `new`, in which case the duplicate slot is cleared. `old` is
    /// tombstoned with a redirect; redirects that pointed at `old` are
    /// re-pointed at `new` so chains stay one hop long.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) {
        if old == new {
            return;
        }
        let Some(old_mp) = self.map_points.get_mut(&old) else {
            return;
        };
        if old_mp.is_bad && old_mp.replaced_by.is_some() {
            return;
        }
        let observations: Vec<(KeyFrameId, usize)> = old_mp.observations.drain().collect();
        let (visible, found) = (old_mp.visible_count, old_mp.found_count);
        old_mp.is_bad = true;
        old_mp.replaced_by = Some(new);

        for (kf_id, slot) in observations {
            let already_observed = self
                .map_points
                .get(&new)
                .map_or(false, |mp| mp.is_observed_by(kf_id));
            let Some(kf) = self.keyframes.get_mut(&kf_id) else {
                continue;
            };
            if already_observed {
                kf.erase_map_point(slot);
            } else {
                kf.set_map_point(slot, new);
                if let Some(mp) = self.map_points.get_mut(&new) {
                    mp.add_observation(kf_id, slot);
                }
            }
        }

        if let Some(mp) = self.map_points.get_mut(&new) {
            mp.visible_count += visible;
            mp.found_count += found;
        }
        let mut redirected = self.redirects_to.remove(&old).unwrap_or_default();
        for id in &redirected {
            if let Some(mp) = self.map_points.get_mut(id) {
                mp.replaced_by = Some(new);
            }
        }
        redirected.push(old);
        self.redirects_to.entry(new).or_default().extend(redirected);

        self.compute_distinctive_descriptors(new);
    }

    /// Pick the observation descriptor with the least median distance to all
    /// other observation descriptors.
    pub fn compute_distinctive_descriptors(&mut self, mp_id: MapPointId) {
        let descriptors: Vec<Descriptor> = match self.good_map_point(mp_id) {
            Some(mp) => mp
                .observations
                .iter()
                .filter_map(|(kf_id, &slot)| {
                    self.good_keyframe(*kf_id)
                        .and_then(|kf| kf.feature(slot))
                        .map(|f| f.descriptor)
                })
                .collect(),
            None => return,
        };
        if descriptors.is_empty() {
            return;
        }

        let n = descriptors.len();
        let mut best_median = u32::MAX;
        let mut best_idx = 0;
        for i in 0..n {
            let mut dists: Vec<u32> = (0..n)
                .map(|j| descriptor_distance(&descriptors[i], &descriptors[j]))
                .collect();
            dists.sort_unstable();
            let median = dists[(n - 1) / 2];
            if median < best_median {
                best_median = median;
                best_idx = i;
            }
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.descriptor = descriptors[best_idx];
        }
    }

    /// Update the mean viewing direction and scale-invariance distance
    /// bounds of a MapPoint from its current observers.
    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.good_map_point(mp_id) else {
            return;
        };
        if mp.observations.is_empty() {
            return;
        }

        let mut normal_sum = Vector3::zeros();
        let mut count = 0usize;
        for kf_id in mp.observations.keys() {
            if let Some(kf) = self.good_keyframe(*kf_id) {
                let dir = mp.position - kf.rig_center();
                let norm = dir.norm();
                if norm > 1e-10 {
                    normal_sum += dir / norm;
                    count += 1;
                }
            }
        }

        // Reference keyframe may have been erased; fall back to any observer.
        let reference = mp
            .observations
            .get_key_value(&mp.reference_kf)
            .or_else(|| mp.observations.iter().min_by_key(|(id, _)| **id))
            .and_then(|(kf_id, &slot)| {
                let kf = self.good_keyframe(*kf_id)?;
                Some((kf.rig_center(), kf.feature(slot)?.octave))
            });

        let position = mp.position;
        let Some((ref_center, octave)) = reference else {
            return;
        };
        let dist = (position - ref_center).norm();
        let level_scale = self.level_scale(octave);
        let num_levels = self.num_levels;
        let scale_factor = self.scale_factor;

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            if count > 0 {
                mp.normal = normal_sum / count as f64;
                let n = mp.normal.norm();
                if n > 1e-10 {
                    mp.normal /= n;
                }
            }
            mp.max_distance = dist * level_scale;
            mp.min_distance = mp.max_distance / scale_factor.powi(num_levels as i32 - 1);
        }
    }

    /// All MapPoints observed by a set of KeyFrames.
    pub fn get_map_points_from_keyframes(&self, kf_ids: &[KeyFrameId]) -> HashSet<MapPointId> {
        kf_ids
            .iter()
            .filter_map(|id| self.keyframes.get(id))
            .flat_map(|kf| kf.get_map_point_indices().map(|(_, mp)| mp))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Erase Protection
    // ─────────────────────────────────────────────────────────────────────────

    /// Take the erase-protection lease of a KeyFrame.
    ///
    /// Works under a shared borrow; the returned lease outlives the lock guard.
    pub fn acquire_lease(&self, kf_id: KeyFrameId) -> Option<ErasureLease> {
        let kf = self.keyframes.get(&kf_id)?;
        ErasureLease::acquire(kf_id, kf.protection(), &self.lease_ledger)
    }

    pub fn lease_ledger(&self) -> &Arc<LeaseLedger> {
        &self.lease_ledger
    }

    /// Request the erasure of a KeyFrame (e.g. by keyframe culling).
    ///
    /// Returns true if the KeyFrame was erased now. A protected KeyFrame is
    /// queued and erased by [`Map::flush_pending_erasures`] once its lease is
    /// gone; KeyFrames with loop edges and the origin are never erased.
    pub fn request_keyframe_erase(&mut self, kf_id: KeyFrameId) -> bool {
        if Some(kf_id) == self.origin_kf_id {
            return false;
        }
        let Some(kf) = self.keyframes.get_mut(&kf_id) else {
            return false;
        };
        if kf.is_bad || !kf.loop_edges().is_empty() {
            return false;
        }
        if kf.protection().is_held() {
            kf.pending_erase = true;
            self.pending_erasures.insert(kf_id);
            return false;
        }
        self.set_bad_keyframe(kf_id);
        true
    }

    /// Erase pending KeyFrames whose protection has been released.
    pub fn flush_pending_erasures(&mut self) -> usize {
        let ready: Vec<KeyFrameId> = self
            .pending_erasures
            .iter()
            .copied()
            .filter(|id| {
                self.keyframes
                    .get(id)
                    .map_or(true, |kf| !kf.protection().is_held())
            })
            .collect();

        let mut erased = 0;
        for kf_id in ready {
            self.pending_erasures.remove(&kf_id);
            let still_erasable = self
                .keyframes
                .get_mut(&kf_id)
                .map(|kf| {
                    kf.pending_erase = false;
                    !kf.is_bad && kf.loop_edges().is_empty()
                })
                .unwrap_or(false);
            if still_erasable {
                self.set_bad_keyframe(kf_id);
                erased += 1;
            }
        }
        erased
    }

    pub fn num_pending_erasures(&self) -> usize {
        self.pending_erasures.len()
    }

    /// Tombstone a KeyFrame and detach it from the graph.
    fn set_bad_keyframe(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        let mp_associations: Vec<MapPointId> = kf.get_map_point_indices().map(|(_, mp)| mp).collect();
        let covisibles: Vec<KeyFrameId> = kf.covisibility_weights().keys().copied().collect();
        let parent_id = kf.parent_id;
        let children: Vec<KeyFrameId> = kf.children_ids.iter().copied().collect();

        for mp_id in mp_associations {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.erase_observation(kf_id);
            }
        }
        for other in covisibles {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }

        // Reparent children to the grandparent.
        if let Some(parent) = parent_id {
            if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                parent_kf.erase_child(kf_id);
                for child in &children {
                    parent_kf.add_child(*child);
                }
            }
            for child in &children {
                if let Some(child_kf) = self.keyframes.get_mut(child) {
                    child_kf.set_parent(parent);
                }
            }
        }

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_covisibilities(HashMap::new());
            kf.children_ids.clear();
            kf.map_point_ids.iter_mut().for_each(|slot| *slot = None);
            kf.set_bad();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Optimization Epoch
    // ─────────────────────────────────────────────────────────────────────────

    /// Record that a loop correction by `kf_id` reshaped the map.
    ///
    /// Idempotent per correcting KeyFrame: repeated calls for the same event
    /// advance the epoch once. Returns whether the epoch advanced.
    pub fn mark_optimized(&mut self, kf_id: KeyFrameId) -> bool {
        if self.last_optimized_by == Some(kf_id) {
            return false;
        }
        self.last_optimized_by = Some(kf_id);
        self.optimization_epoch += 1;
        true
    }

    pub fn optimization_epoch(&self) -> u64 {
        self.optimization_epoch
    }

    /// Clear the entire map.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.pending_erasures.clear();
        self.redirects_to.clear();
        self.origin_kf_id = None;
        self.next_kf_id = 0;
        self.next_mp_id = 0;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("optimization_epoch", &self.optimization_epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    fn features(n: usize) -> Vec<Feature> {
        (0..n)
            .map(|i| Feature::new(0, Vector2::new(i as f64, 0.0), 0, [i as u8; 32]))
            .collect()
    }

    fn create_keyframe(map: &mut Map, n: usize) -> KeyFrameId {
        map.create_keyframe(0, SE3::identity(), features(n), BowVector::new())
    }

    /// Two keyframes sharing `shared` landmarks in slots 0..shared.
    fn shared_pair(map: &mut Map, shared: usize) -> (KeyFrameId, KeyFrameId) {
        let kf1 = create_keyframe(map, 40);
        let kf2 = create_keyframe(map, 40);
        for i in 0..shared {
            let mp = map.create_map_point(Vector3::new(i as f64, 0.0, 5.0), [i as u8; 32], kf1);
            map.associate(kf1, i, mp);
            map.associate(kf2, i, mp);
        }
        (kf1, kf2)
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut map = Map::new();
        let a = create_keyframe(&mut map, 1);
        let b = create_keyframe(&mut map, 1);
        assert_eq!(a, KeyFrameId::new(0));
        assert!(b > a);
        assert_eq!(map.origin_keyframe_id(), Some(a));
        assert_eq!(map.all_keyframes(), vec![a, b]);
    }

    #[test]
    fn test_associate_rejects_duplicate_observer() {
        let mut map = Map::new();
        let kf = create_keyframe(&mut map, 5);
        let mp = map.create_map_point(Vector3::new(1.0, 0.0, 5.0), [0u8; 32], kf);

        assert!(map.associate(kf, 0, mp));
        assert!(!map.associate(kf, 1, mp));
        assert!(!map.associate(kf, 99, mp));
        assert_eq!(map.get_map_point(mp).unwrap().num_observations(), 1);

        assert_eq!(map.disassociate(kf, 0), Some(mp));
        assert_eq!(map.get_map_point(mp).unwrap().num_observations(), 0);
    }

    #[test]
    fn test_update_connections_weights_and_parent() {
        let mut map = Map::new();
        let (kf1, kf2) = shared_pair(&mut map, 20);

        map.update_connections(kf2);

        assert_eq!(map.get_keyframe(kf2).unwrap().get_covisibility_weight(kf1), 20);
        assert_eq!(map.get_keyframe(kf1).unwrap().get_covisibility_weight(kf2), 20);
        assert_eq!(map.get_keyframe(kf2).unwrap().parent_id, Some(kf1));
        assert!(map.get_keyframe(kf1).unwrap().children_ids.contains(&kf2));
    }

    #[test]
    fn test_update_connections_keeps_best_weak_edge() {
        let mut map = Map::new();
        let (kf1, kf2) = shared_pair(&mut map, 3);

        map.update_connections(kf2);
        assert_eq!(map.get_keyframe(kf2).unwrap().get_covisibility_weight(kf1), 3);
    }

    #[test]
    fn test_replace_map_point_redirects_and_tombstones() {
        let mut map = Map::new();
        let kf1 = create_keyframe(&mut map, 5);
        let kf2 = create_keyframe(&mut map, 5);
        let kf3 = create_keyframe(&mut map, 5);

        let survivor = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [1u8; 32], kf1);
        let dup = map.create_map_point(Vector3::new(0.1, 0.0, 5.0), [2u8; 32], kf2);
        let older_dup = map.create_map_point(Vector3::new(0.2, 0.0, 5.0), [3u8; 32], kf3);

        map.associate(kf1, 0, survivor);
        map.associate(kf2, 1, dup);
        map.associate(kf1, 2, dup); // kf1 sees both: its dup slot must be cleared
        map.associate(kf3, 4, older_dup);

        map.replace_map_point(older_dup, dup);
        map.replace_map_point(dup, survivor);

        let s = map.get_map_point(survivor).unwrap();
        assert_eq!(s.num_observations(), 3);
        assert_eq!(map.get_keyframe(kf2).unwrap().get_map_point(1), Some(survivor));
        assert_eq!(map.get_keyframe(kf3).unwrap().get_map_point(4), Some(survivor));
        assert_eq!(map.get_keyframe(kf1).unwrap().get_map_point(2), None);

        let d = map.get_map_point(dup).unwrap();
        assert!(d.is_bad);
        assert_eq!(d.num_observations(), 0);

        // Redirect chains resolve to the survivor in one hop.
        assert_eq!(map.get_map_point(older_dup).unwrap().replaced_by, Some(survivor));
        assert_eq!(map.resolve_map_point(older_dup), survivor);
        assert_eq!(map.resolve_map_point(survivor), survivor);
    }

    #[test]
    fn test_repeated_merges_keep_redirects_one_hop() {
        let mut map = Map::new();
        let kf = create_keyframe(&mut map, 8);
        let ids: Vec<MapPointId> = (0..5)
            .map(|i| {
                let mp = map.create_map_point(Vector3::new(i as f64, 0.0, 5.0), [i as u8; 32], kf);
                map.associate(kf, i, mp);
                mp
            })
            .collect();

        // 0 -> 1 -> 2 -> 3 -> 4, each survivor later merged away itself.
        for pair in ids.windows(2) {
            map.replace_map_point(pair[0], pair[1]);
        }

        let last = ids[4];
        for &id in &ids[..4] {
            assert_eq!(map.get_map_point(id).unwrap().replaced_by, Some(last));
            assert_eq!(map.resolve_map_point(id), last);
        }
        assert_eq!(map.redirects_to.len(), 1);
        assert_eq!(map.redirects_to[&last].len(), 4);
        // A tombstone cannot be merged twice.
        map.replace_map_point(ids[0], ids[2]);
        assert_eq!(map.get_map_point(ids[0]).unwrap().replaced_by, Some(last));
    }

    #[test]
    fn test_distinctive_descriptor_is_medoid() {
        let mut map = Map::new();
        let mut kfs = Vec::new();
        for byte in [0x01u8, 0x01, 0x00, 0xFF] {
            let kf = create_keyframe(&mut map, 1);
            map.get_keyframe_mut(kf).unwrap().features[0].descriptor = [byte; 32];
            kfs.push(kf);
        }

        let mp = map.create_map_point(Vector3::zeros(), [0xFF; 32], kfs[0]);
        for &kf in &kfs {
            map.associate(kf, 0, mp);
        }
        map.compute_distinctive_descriptors(mp);
        assert_eq!(map.get_map_point(mp).unwrap().descriptor, [0x01; 32]);
    }

    #[test]
    fn test_normal_and_depth() {
        let mut map = Map::new();
        let kf = create_keyframe(&mut map, 1);
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 4.0), [0u8; 32], kf);
        map.associate(kf, 0, mp);

        map.update_map_point_normal_and_depth(mp);
        let p = map.get_map_point(mp).unwrap();
        approx::assert_relative_eq!(p.normal, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
        approx::assert_relative_eq!(p.max_distance, 4.0, epsilon = 1e-12);
        approx::assert_relative_eq!(p.min_distance, 4.0 / 1.2f64.powi(7), epsilon = 1e-12);
    }

    #[test]
    fn test_protected_keyframe_erasure_is_deferred() {
        let mut map = Map::new();
        let _origin = create_keyframe(&mut map, 1);
        let kf = create_keyframe(&mut map, 1);

        let lease = map.acquire_lease(kf).unwrap();
        assert!(!map.request_keyframe_erase(kf));
        assert_eq!(map.num_pending_erasures(), 1);
        assert_eq!(map.flush_pending_erasures(), 0);
        assert!(!map.get_keyframe(kf).unwrap().is_bad);

        drop(lease);
        assert_eq!(map.flush_pending_erasures(), 1);
        assert!(map.get_keyframe(kf).unwrap().is_bad);
        assert_eq!(map.lease_ledger().outstanding(), 0);
    }

    #[test]
    fn test_loop_edge_and_origin_never_erased() {
        let mut map = Map::new();
        let origin = create_keyframe(&mut map, 1);
        let a = create_keyframe(&mut map, 1);
        let b = create_keyframe(&mut map, 1);

        map.add_loop_edge(a, b);
        assert!(map.get_keyframe(b).unwrap().loop_edges().contains(&a));
        assert!(!map.request_keyframe_erase(a));
        assert!(!map.request_keyframe_erase(origin));
        assert_eq!(map.all_keyframes().len(), 3);
    }

    #[test]
    fn test_erase_reparents_children() {
        let mut map = Map::new();
        let root = create_keyframe(&mut map, 1);
        let mid = create_keyframe(&mut map, 1);
        let leaf = create_keyframe(&mut map, 1);
        map.get_keyframe_mut(mid).unwrap().set_parent(root);
        map.get_keyframe_mut(root).unwrap().add_child(mid);
        map.get_keyframe_mut(leaf).unwrap().set_parent(mid);
        map.get_keyframe_mut(mid).unwrap().add_child(leaf);

        assert!(map.request_keyframe_erase(mid));
        assert_eq!(map.get_keyframe(leaf).unwrap().parent_id, Some(root));
        assert!(map.get_keyframe(root).unwrap().children_ids.contains(&leaf));
    }

    #[test]
    fn test_mark_optimized_is_idempotent_per_event() {
        let mut map = Map::new();
        let kf = KeyFrameId::new(12);
        assert!(map.mark_optimized(kf));
        assert!(!map.mark_optimized(kf));
        assert_eq!(map.optimization_epoch(), 1);
        assert!(map.mark_optimized(KeyFrameId::new(30)));
        assert_eq!(map.optimization_epoch(), 2);
    }
}
