//! RigMatcher - Hamming-distance matcher aware of multi-camera rigs.
//!
//! Landmarks are projected into every camera of the rig; a feature is a
//! candidate only if it was detected by the camera the landmark projects
//! into, near the projection, at a pyramid level compatible with the
//! landmark's predicted scale.

use std::collections::HashSet;
use std::sync::Arc;

use nalgebra::{Vector2, Vector3};
use tracing::debug;

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
use crate::geometry::Sim3;
use crate::tracking::frame::{descriptor_distance, Descriptor, RigProjection};

use super::{DescriptorMatcher, MatcherConfig, Replacement};

/// Descriptor matcher projecting through a [`RigProjection`].
pub struct RigMatcher {
    rig: Arc<dyn RigProjection>,
    config: MatcherConfig,
}

impl RigMatcher {
    pub fn new(rig: Arc<dyn RigProjection>, config: MatcherConfig) -> Self {
        Self { rig, config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Cameras the rig-frame point projects into, with pixel coordinates.
    fn project_into_rig(&self, p_rig: &Vector3<f64>) -> Vec<(usize, Vector2<f64>)> {
        (0..self.rig.num_cameras())
            .filter_map(|cam| self.rig.project(cam, p_rig).map(|uv| (cam, uv)))
            .collect()
    }

    /// Closest feature (by descriptor) around the projections of `p_rig`.
    fn best_in_area(
        &self,
        kf: &KeyFrame,
        p_rig: &Vector3<f64>,
        descriptor: &Descriptor,
        radius: f64,
        level: Option<i32>,
        accept_slot: impl Fn(usize) -> bool,
    ) -> Option<(usize, u32)> {
        let (min_level, max_level) = match level {
            Some(l) => (Some(l - 1), Some(l)),
            None => (None, None),
        };

        let mut best: Option<(usize, u32)> = None;
        for (cam, uv) in self.project_into_rig(p_rig) {
            for idx in kf.get_features_in_area(cam, uv.x, uv.y, radius, min_level, max_level) {
                if !accept_slot(idx) {
                    continue;
                }
                let Some(feature) = kf.feature(idx) else {
                    continue;
                };
                let dist = descriptor_distance(descriptor, &feature.descriptor);
                if best.map_or(true, |(_, d)| dist < d) {
                    best = Some((idx, dist));
                }
            }
        }
        best
    }
}

/// Predicted pyramid level, if the landmark has scale statistics.
fn predicted_level(map: &Map, mp: &MapPoint, dist: f64) -> Option<i32> {
    if !mp.max_distance.is_finite() {
        return None;
    }
    Some(mp.predict_scale(dist, map.scale_factor(), map.num_levels()))
}

fn search_radius(map: &Map, base: f64, level: Option<i32>) -> f64 {
    level.map_or(base, |l| base * map.level_scale(l))
}

/// Distance and viewing-angle gate relative to a viewer at `center`.
fn is_viewable(mp: &MapPoint, center: &Vector3<f64>, dist: f64) -> bool {
    if !mp.is_in_distance_range(dist) {
        return false;
    }
    // Reject viewing angles above 60 degrees from the mean direction.
    let has_normal = mp.normal.norm_squared() > 0.0;
    !(has_normal && (mp.position - center).dot(&mp.normal) < 0.5 * dist)
}

/// Good landmarks of a keyframe with their slots.
fn good_slots<'a>(map: &'a Map, kf: &'a KeyFrame) -> impl Iterator<Item = (usize, &'a MapPoint)> + 'a {
    kf.get_map_point_indices()
        .filter_map(move |(idx, mp_id)| map.good_map_point(mp_id).map(|mp| (idx, mp)))
}

impl DescriptorMatcher for RigMatcher {
    fn search_by_appearance(
        &self,
        map: &Map,
        kf1: KeyFrameId,
        kf2: KeyFrameId,
        matches: &mut Vec<Option<MapPointId>>,
    ) -> usize {
        let (Some(kf1), Some(kf2)) = (map.good_keyframe(kf1), map.good_keyframe(kf2)) else {
            matches.clear();
            return 0;
        };
        matches.clear();
        matches.resize(kf1.num_features(), None);

        let candidates: Vec<(usize, &MapPoint)> = good_slots(map, kf2).collect();
        let mut used2: HashSet<usize> = HashSet::new();
        let mut found = 0;

        for (idx1, _) in good_slots(map, kf1) {
            let Some(f1) = kf1.feature(idx1) else {
                continue;
            };

            let mut best = (u32::MAX, None);
            let mut second = u32::MAX;
            for (idx2, mp2) in &candidates {
                if used2.contains(idx2) {
                    continue;
                }
                let Some(f2) = kf2.feature(*idx2) else {
                    continue;
                };
                let dist = descriptor_distance(&f1.descriptor, &f2.descriptor);
                if dist < best.0 {
                    second = best.0;
                    best = (dist, Some((*idx2, mp2.id)));
                } else if dist < second {
                    second = dist;
                }
            }

            if let (dist, Some((idx2, mp2))) = best {
                if dist <= self.config.th_low
                    && (dist as f64) < self.config.appearance_ratio * second as f64
                {
                    matches[idx1] = Some(mp2);
                    used2.insert(idx2);
                    found += 1;
                }
            }
        }

        debug!("[Matcher] appearance {} ↔ {}: {} matches", kf1.id, kf2.id, found);
        found
    }

    fn search_by_similarity(
        &self,
        map: &Map,
        kf1: KeyFrameId,
        kf2: KeyFrameId,
        matches: &mut [Option<MapPointId>],
        s12: &Sim3,
        radius: f64,
    ) -> usize {
        let (Some(kf1), Some(kf2)) = (map.good_keyframe(kf1), map.good_keyframe(kf2)) else {
            return 0;
        };
        let t1w = kf1.pose_cw();
        let t2w = kf2.pose_cw();
        let s21 = s12.inverse();

        let already_matched2: HashSet<usize> = matches
            .iter()
            .flatten()
            .filter_map(|mp| kf2.slot_of(map.resolve_map_point(*mp)))
            .collect();

        // kf1 landmarks projected into kf2.
        let mut match12: Vec<Option<usize>> = vec![None; kf1.num_features()];
        for (idx1, mp) in good_slots(map, kf1) {
            if matches.get(idx1).map_or(true, |m| m.is_some()) {
                continue;
            }
            let p_c2 = s21.transform_point(&t1w.transform_point(&mp.position));
            let dist = p_c2.norm();
            if !mp.is_in_distance_range(dist) {
                continue;
            }
            let level = predicted_level(map, mp, dist);
            let r = search_radius(map, radius, level);
            if let Some((idx2, d)) = self.best_in_area(kf2, &p_c2, &mp.descriptor, r, level, |_| true) {
                if d <= self.config.th_high {
                    match12[idx1] = Some(idx2);
                }
            }
        }

        // kf2 landmarks projected into kf1.
        let mut match21: Vec<Option<usize>> = vec![None; kf2.num_features()];
        for (idx2, mp) in good_slots(map, kf2) {
            if already_matched2.contains(&idx2) {
                continue;
            }
            let p_c1 = s12.transform_point(&t2w.transform_point(&mp.position));
            let dist = p_c1.norm();
            if !mp.is_in_distance_range(dist) {
                continue;
            }
            let level = predicted_level(map, mp, dist);
            let r = search_radius(map, radius, level);
            if let Some((idx1, d)) = self.best_in_area(kf1, &p_c1, &mp.descriptor, r, level, |_| true) {
                if d <= self.config.th_high {
                    match21[idx2] = Some(idx1);
                }
            }
        }

        // Keep mutual matches only.
        let mut found = 0;
        for (idx1, m) in match12.iter().enumerate() {
            let Some(idx2) = *m else {
                continue;
            };
            if match21.get(idx2).copied().flatten() != Some(idx1) {
                continue;
            }
            if let (Some(mp2), Some(slot)) = (kf2.get_map_point(idx2), matches.get_mut(idx1)) {
                *slot = Some(mp2);
                found += 1;
            }
        }

        debug!("[Matcher] similarity {} ↔ {}: {} new matches", kf1.id, kf2.id, found);
        found
    }

    fn search_by_projection(
        &self,
        map: &Map,
        kf: KeyFrameId,
        scw: &Sim3,
        points: &[MapPointId],
        matches: &mut [Option<MapPointId>],
        radius: f64,
    ) -> usize {
        let Some(kf) = map.good_keyframe(kf) else {
            return 0;
        };
        let tcw = scw.to_rigid();
        let center = tcw.inverse().translation;

        let mut already_found: HashSet<MapPointId> = matches.iter().flatten().copied().collect();
        let mut found = 0;

        for &mp_id in points {
            let Some(mp) = map.good_map_point(mp_id) else {
                continue;
            };
            if already_found.contains(&mp_id) {
                continue;
            }
            let p_c = tcw.transform_point(&mp.position);
            let dist = (mp.position - center).norm();
            if !is_viewable(mp, &center, dist) {
                continue;
            }
            let level = predicted_level(map, mp, dist);
            let r = search_radius(map, radius, level);
            let free = |idx: usize| matches.get(idx).map_or(false, |m| m.is_none());
            let Some((idx, d)) = self.best_in_area(kf, &p_c, &mp.descriptor, r, level, free) else {
                continue;
            };
            if d <= self.config.th_low {
                matches[idx] = Some(mp_id);
                already_found.insert(mp_id);
                found += 1;
            }
        }

        found
    }

    fn fuse(
        &self,
        map: &mut Map,
        kf_id: KeyFrameId,
        scw: &Sim3,
        points: &[MapPointId],
        radius: f64,
        replacements: &mut Vec<Replacement>,
    ) -> usize {
        let reported_before = replacements.len();

        // Collect decisions under a shared borrow, then apply.
        let mut attach: Vec<(usize, MapPointId)> = Vec::new();
        {
            let map_ref: &Map = map;
            let Some(kf) = map_ref.good_keyframe(kf_id) else {
                return 0;
            };
            let tcw = scw.to_rigid();
            let center = tcw.inverse().translation;
            let mut used_slots: HashSet<usize> = HashSet::new();
            let mut seen: HashSet<MapPointId> = HashSet::new();

            for &mp_id in points {
                let Some(mp) = map_ref.good_map_point(mp_id) else {
                    continue;
                };
                if mp.is_observed_by(kf_id) || !seen.insert(mp_id) {
                    continue;
                }
                let p_c = tcw.transform_point(&mp.position);
                let dist = (mp.position - center).norm();
                if !is_viewable(mp, &center, dist) {
                    continue;
                }
                let level = predicted_level(map_ref, mp, dist);
                let r = search_radius(map_ref, radius, level);
                let free = |idx: usize| !used_slots.contains(&idx);
                let Some((idx, d)) = self.best_in_area(kf, &p_c, &mp.descriptor, r, level, free) else {
                    continue;
                };
                if d > self.config.th_low {
                    continue;
                }
                used_slots.insert(idx);
                match kf.get_map_point(idx) {
                    Some(existing) if map_ref.good_map_point(existing).is_some() => {
                        replacements.push((existing, mp_id));
                    }
                    _ => attach.push((idx, mp_id)),
                }
            }
        }

        let fused = replacements.len() - reported_before;
        let mut attached = 0;
        for (idx, mp_id) in attach {
            map.disassociate(kf_id, idx);
            if map.associate(kf_id, idx, mp_id) {
                attached += 1;
            }
        }
        attached + fused
    }
}
