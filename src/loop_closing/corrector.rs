//! Loop correction: propagate the loop similarity through the current
//! keyframe's neighbourhood, merge duplicate landmarks and optimize the
//! essential graph.
//!
//! Local mapping is paused for the whole correction. The map write lock is
//! held while poses and landmarks of the window are rewritten, released for
//! the pose graph optimization (which takes its own locks), and taken again
//! briefly to record the loop edge.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::Sim3;
use crate::matcher::DescriptorMatcher;
use crate::optimizer::{GraphOptimizer, PoseGraphResult};
use crate::system::SharedState;

pub use crate::optimizer::{KeyFrameAndPose, LoopConnections};

use super::estimator::LoopMatch;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrectorConfig {
    /// How long to wait for local mapping to acknowledge the pause.
    pub pause_timeout_ms: u64,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self { pause_timeout_ms: 5000 }
    }
}

/// What a completed correction changed.
#[derive(Debug)]
pub struct CorrectionReport {
    pub current_kf: KeyFrameId,
    pub matched_kf: KeyFrameId,
    /// Current keyframe and its covisible neighbours, in correction order.
    pub window: Vec<KeyFrameId>,
    pub landmarks_corrected: usize,
    /// Loop landmarks attached to empty slots.
    pub landmarks_attached: usize,
    /// Duplicate landmarks merged into a survivor.
    pub landmarks_merged: usize,
    /// Keyframes that gained covisibility links across the loop.
    pub loop_connections: LoopConnections,
    /// `None` when the essential graph had nothing to optimize.
    pub pose_graph: Option<PoseGraphResult>,
}

#[derive(Debug)]
pub enum CorrectionOutcome {
    Corrected(CorrectionReport),
    /// Local mapping never paused (or shutdown was requested); the map is
    /// untouched.
    Aborted,
}

pub struct LoopCorrector {
    matcher: Arc<dyn DescriptorMatcher>,
    optimizer: Arc<dyn GraphOptimizer>,
    config: CorrectorConfig,
    fuse_radius: f64,
}

impl LoopCorrector {
    pub fn new(
        matcher: Arc<dyn DescriptorMatcher>,
        optimizer: Arc<dyn GraphOptimizer>,
        config: CorrectorConfig,
        fuse_radius: f64,
    ) -> Self {
        Self {
            matcher,
            optimizer,
            config,
            fuse_radius,
        }
    }

    /// Close the loop described by `loop_match`.
    ///
    /// Consumes the match; its keyframe leases are released before deferred
    /// erasures are flushed.
    pub fn correct(&self, shared: &SharedState, loop_match: LoopMatch) -> CorrectionOutcome {
        let current_kf = loop_match.current_kf;
        let matched_kf = loop_match.matched_kf;

        shared.mapping.request_pause();
        let timeout = Duration::from_millis(self.config.pause_timeout_ms);
        if !shared.mapping.wait_until_paused(timeout, shared.shutdown_flag()) {
            warn!(
                "[LoopCorrector] local mapping did not pause within {:?}; dropping loop {} ↔ {}",
                timeout, current_kf, matched_kf
            );
            shared.mapping.resume();
            return CorrectionOutcome::Aborted;
        }

        let applied = {
            let mut map = shared.map.write();
            self.apply_correction(&mut map, &loop_match)
        };
        let Some(applied) = applied else {
            warn!("[LoopCorrector] {} vanished before correction", current_kf);
            shared.mapping.resume();
            return CorrectionOutcome::Aborted;
        };

        shared.tracking.force_relocalization();

        let pose_graph = self.optimizer.optimize_pose_graph(
            &shared.map,
            matched_kf,
            current_kf,
            &loop_match.scw,
            &applied.non_corrected,
            &applied.corrected,
            &applied.loop_connections,
        );
        if pose_graph.is_none() {
            debug!("[LoopCorrector] essential graph left unchanged");
        }

        {
            let mut map = shared.map.write();
            map.add_loop_edge(current_kf, matched_kf);
            map.mark_optimized(current_kf);
        }
        shared.mapping.resume();

        // Leases go before the flush so the loop pair can be erased if queued.
        drop(loop_match);
        let flushed = shared.map.write().flush_pending_erasures();

        info!(
            "[LoopCorrector] loop {} ↔ {} closed: {} keyframes, {} landmarks corrected, {} merged, {} attached, {} deferred erasures",
            current_kf,
            matched_kf,
            applied.window.len(),
            applied.landmarks_corrected,
            applied.landmarks_merged,
            applied.landmarks_attached,
            flushed
        );

        CorrectionOutcome::Corrected(CorrectionReport {
            current_kf,
            matched_kf,
            window: applied.window,
            landmarks_corrected: applied.landmarks_corrected,
            landmarks_attached: applied.landmarks_attached,
            landmarks_merged: applied.landmarks_merged,
            loop_connections: applied.loop_connections,
            pose_graph,
        })
    }

    /// Everything done under the write lock.
    fn apply_correction(&self, map: &mut Map, loop_match: &LoopMatch) -> Option<AppliedCorrection> {
        let current_kf = loop_match.current_kf;
        map.update_connections(current_kf);

        let current = map.good_keyframe(current_kf)?;
        let twc = current.pose.clone();
        let mut window = vec![current_kf];
        window.extend(current.covisibles());

        let mut corrected = KeyFrameAndPose::new();
        let mut non_corrected = KeyFrameAndPose::new();
        for &kf_id in &window {
            let Some(kf) = map.good_keyframe(kf_id) else {
                continue;
            };
            let tiw = kf.pose_cw();
            let siw = if kf_id == current_kf {
                loop_match.scw.clone()
            } else {
                Sim3::from_se3(&tiw.compose(&twc)).compose(&loop_match.scw)
            };
            corrected.insert(kf_id, siw);
            non_corrected.insert(kf_id, Sim3::from_se3(&tiw));
        }

        let landmarks_corrected = correct_window(map, current_kf, &window, &corrected, &non_corrected);
        let (landmarks_attached, mut landmarks_merged) = fuse_current_matches(map, current_kf, &loop_match.current_matches);
        landmarks_merged += self.fuse_loop_points(map, &window, &corrected, &loop_match.loop_points);
        let loop_connections = collect_loop_connections(map, &window);

        Some(AppliedCorrection {
            window,
            corrected,
            non_corrected,
            loop_connections,
            landmarks_corrected,
            landmarks_attached,
            landmarks_merged,
        })
    }

    /// Project the loop landmarks into every window keyframe with its
    /// corrected pose and merge what lands on an occupied slot. Returns the
    /// number of merges.
    fn fuse_loop_points(
        &self,
        map: &mut Map,
        window: &[KeyFrameId],
        corrected: &KeyFrameAndPose,
        loop_points: &[MapPointId],
    ) -> usize {
        let mut points: Vec<MapPointId> = loop_points
            .iter()
            .map(|&mp| map.resolve_map_point(mp))
            .filter(|&mp| map.good_map_point(mp).is_some())
            .collect();
        points.sort_unstable();
        points.dedup();

        let mut merged = 0;
        for kf_id in window {
            let Some(scw) = corrected.get(kf_id) else {
                continue;
            };
            let mut replacements = Vec::new();
            self.matcher
                .fuse(map, *kf_id, scw, &points, self.fuse_radius, &mut replacements);

            for (existing, projected) in replacements {
                let existing = map.resolve_map_point(existing);
                let projected = map.resolve_map_point(projected);
                if existing == projected
                    || map.good_map_point(existing).is_none()
                    || map.good_map_point(projected).is_none()
                {
                    continue;
                }
                map.replace_map_point(existing, projected);
                merged += 1;
            }
        }
        merged
    }
}

struct AppliedCorrection {
    window: Vec<KeyFrameId>,
    corrected: KeyFrameAndPose,
    non_corrected: KeyFrameAndPose,
    loop_connections: LoopConnections,
    landmarks_corrected: usize,
    landmarks_attached: usize,
    landmarks_merged: usize,
}

/// Move the window's landmarks with their keyframe's correction and commit
/// the corrected poses. A landmark seen from several window keyframes moves
/// once, with the first of them.
fn correct_window(
    map: &mut Map,
    current_kf: KeyFrameId,
    window: &[KeyFrameId],
    corrected: &KeyFrameAndPose,
    non_corrected: &KeyFrameAndPose,
) -> usize {
    let mut moved = 0;
    for &kf_id in window {
        let (Some(siw_new), Some(siw_old)) = (corrected.get(&kf_id), non_corrected.get(&kf_id)) else {
            continue;
        };
        let correction = siw_new.inverse().compose(siw_old);

        let observed: Vec<MapPointId> = match map.good_keyframe(kf_id) {
            Some(kf) => kf.get_map_point_indices().map(|(_, mp)| mp).collect(),
            None => continue,
        };
        for mp_id in observed {
            let Some(mp) = map.get_map_point_mut(mp_id) else {
                continue;
            };
            if mp.is_bad || mp.corrected_by_kf == Some(current_kf) {
                continue;
            }
            mp.position = correction.transform_point(&mp.position);
            mp.corrected_by_kf = Some(current_kf);
            mp.corrected_reference = Some(kf_id);
            map.update_map_point_normal_and_depth(mp_id);
            moved += 1;
        }

        if let Some(kf) = map.get_keyframe_mut(kf_id) {
            kf.pose = siw_new.to_rigid().inverse();
        }
        map.update_connections(kf_id);
    }
    moved
}

/// Install the verified loop matches in the current keyframe. Returns
/// `(attached, merged)`.
fn fuse_current_matches(
    map: &mut Map,
    current_kf: KeyFrameId,
    matches: &[Option<MapPointId>],
) -> (usize, usize) {
    let mut attached = 0;
    let mut merged = 0;
    for (slot, loop_mp) in matches.iter().enumerate() {
        let Some(loop_mp) = loop_mp.map(|mp| map.resolve_map_point(mp)) else {
            continue;
        };
        if map.good_map_point(loop_mp).is_none() {
            continue;
        }
        let existing = match map.good_keyframe(current_kf) {
            Some(kf) => kf.get_map_point(slot),
            None => return (attached, merged),
        };

        match existing.map(|mp| map.resolve_map_point(mp)) {
            Some(cur_mp) if cur_mp == loop_mp => {}
            Some(cur_mp) => {
                map.replace_map_point(cur_mp, loop_mp);
                merged += 1;
            }
            None => {
                if map.associate(current_kf, slot, loop_mp) {
                    map.compute_distinctive_descriptors(loop_mp);
                    attached += 1;
                }
            }
        }
    }
    (attached, merged)
}

/// Refresh the window's covisibility and keep the links that now reach
/// outside it.
fn collect_loop_connections(map: &mut Map, window: &[KeyFrameId]) -> LoopConnections {
    let window_set: HashSet<KeyFrameId> = window.iter().copied().collect();
    let mut connections = LoopConnections::new();
    for &kf_id in window {
        let previous: HashSet<KeyFrameId> = match map.good_keyframe(kf_id) {
            Some(kf) => kf.covisibles().into_iter().collect(),
            None => continue,
        };
        map.update_connections(kf_id);

        let Some(kf) = map.good_keyframe(kf_id) else {
            continue;
        };
        let new_links: HashSet<KeyFrameId> = kf
            .covisibles()
            .into_iter()
            .filter(|c| !previous.contains(c) && !window_set.contains(c))
            .collect();
        if !new_links.is_empty() {
            connections.insert(kf_id, new_links);
        }
    }
    connections
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::RwLock;

    use crate::local_mapping::{IdleMapping, LocalMappingGate, MappingControl};
    use crate::loop_closing::estimator::Sim3Estimator;
    use crate::loop_closing::sim3_solver::Sim3SolverConfig;
    use crate::simulation::{pose_error, revisit_scene, Scene};
    use crate::matcher::{MatcherConfig, RigMatcher};
    use crate::optimizer::{LmOptimizer, PoseGraphConfig, Sim3RefineConfig, Sim3Refinement};
    use crate::tracking::frame::RigProjection;
    use crate::tracking::RelocalizationSignal;

    /// Optimizer that leaves the essential graph alone.
    #[derive(Default)]
    struct NoGraphOptimizer {
        calls: AtomicUsize,
    }

    impl GraphOptimizer for NoGraphOptimizer {
        fn refine_similarity(
            &self,
            _map: &Map,
            _kf1: KeyFrameId,
            _kf2: KeyFrameId,
            _matches: &mut [Option<MapPointId>],
            _s12: &Sim3,
            _th2: f64,
            _fix_scale: bool,
        ) -> Option<Sim3Refinement> {
            None
        }

        fn optimize_pose_graph(
            &self,
            _map: &RwLock<Map>,
            _loop_kf: KeyFrameId,
            _current_kf: KeyFrameId,
            _scw: &Sim3,
            _non_corrected: &KeyFrameAndPose,
            _corrected: &KeyFrameAndPose,
            _loop_connections: &LoopConnections,
        ) -> Option<PoseGraphResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    struct Fixture {
        scene: Scene,
        shared: Arc<SharedState>,
        signal: Arc<RelocalizationSignal>,
        matcher: Arc<dyn DescriptorMatcher>,
        loop_match: LoopMatch,
    }

    /// Verify the revisit loop at `revisit[3]` against `early[4]`.
    fn fixture(mapping: Arc<dyn MappingControl>) -> Fixture {
        let mut scene = revisit_scene();
        let rig: Arc<dyn RigProjection> = scene.rig.clone();
        let matcher: Arc<dyn DescriptorMatcher> =
            Arc::new(RigMatcher::new(Arc::clone(&rig), MatcherConfig::default()));
        let estimator = Sim3Estimator::new(
            Arc::clone(&rig),
            Arc::clone(&matcher),
            Arc::new(LmOptimizer::new(rig, Sim3RefineConfig::default(), PoseGraphConfig::default())),
            Sim3SolverConfig::default(),
            10.0,
            10.0,
        );

        let signal = Arc::new(RelocalizationSignal::new());
        let map = std::mem::replace(&mut scene.map, Map::new());
        let shared = SharedState::new(map, mapping, signal.clone());

        let current_kf = scene.revisit[3];
        let detection = {
            let map = shared.map.read();
            crate::loop_closing::detector::Detection {
                current_kf,
                candidates: vec![scene.early[4]],
                lease: map.acquire_lease(current_kf).unwrap(),
            }
        };
        let loop_match = estimator.compute(&shared.map, detection).expect("loop should verify");
        Fixture {
            scene,
            shared,
            signal,
            matcher,
            loop_match,
        }
    }

    fn corrector(matcher: Arc<dyn DescriptorMatcher>, optimizer: Arc<dyn GraphOptimizer>, timeout_ms: u64) -> LoopCorrector {
        LoopCorrector::new(matcher, optimizer, CorrectorConfig { pause_timeout_ms: timeout_ms }, 4.0)
    }

    #[test]
    fn test_window_moves_to_ground_truth() {
        let f = fixture(Arc::new(IdleMapping::new()));
        let optimizer = Arc::new(NoGraphOptimizer::default());
        let corrector = corrector(Arc::clone(&f.matcher), optimizer.clone(), 100);
        let current_kf = f.loop_match.current_kf;

        let (window, window_points) = {
            let mut map = f.shared.map.write();
            map.update_connections(current_kf);
            let mut window = vec![current_kf];
            window.extend(map.get_keyframe(current_kf).unwrap().covisibles());
            let points: HashSet<MapPointId> = window
                .iter()
                .flat_map(|kf| map.get_keyframe(*kf).unwrap().get_map_point_indices().map(|(_, mp)| mp))
                .filter(|mp| map.good_map_point(*mp).is_some())
                .collect();
            (window, points)
        };

        let report = match corrector.correct(&f.shared, f.loop_match) {
            CorrectionOutcome::Corrected(r) => r,
            CorrectionOutcome::Aborted => panic!("correction aborted"),
        };
        assert_eq!(optimizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.window, window);
        // Every window landmark is corrected exactly once, even when several
        // window keyframes observe it.
        assert_eq!(report.landmarks_corrected, window_points.len());
        {
            let map = f.shared.map.read();
            for mp in &window_points {
                assert_eq!(map.get_map_point(*mp).unwrap().corrected_by_kf, Some(current_kf), "{} untouched", mp);
            }
        }
        assert!(report.landmarks_merged > 0);
        for kf in &f.scene.revisit {
            assert!(report.window.contains(kf));
        }

        let map = f.shared.map.read();
        for kf_id in &f.scene.revisit {
            let kf = map.get_keyframe(*kf_id).unwrap();
            let (dt, dr) = pose_error(&kf.pose, &f.scene.true_poses[kf_id]);
            assert!(dt < 1e-3 && dr < 1e-3, "{} off by {} m, {} rad", kf_id, dt, dr);
        }

        // Each landmark was moved once: it reprojects onto its feature.
        let current = map.get_keyframe(report.current_kf).unwrap();
        let tcw = current.pose_cw();
        let mut checked = 0;
        for (slot, mp_id) in current.get_map_point_indices() {
            let Some(mp) = map.good_map_point(mp_id) else {
                continue;
            };
            let feature = current.feature(slot).unwrap();
            let uv = f
                .scene
                .rig
                .project_unbounded(feature.camera, &tcw.transform_point(&mp.position))
                .unwrap();
            assert!((uv - feature.keypoint).norm() < 1e-3, "{} reprojects {} px away", mp_id, (uv - feature.keypoint).norm());
            checked += 1;
        }
        assert!(checked >= 60);

        // The revisit duplicates that were matched are gone.
        let merged = f
            .scene
            .revisit_points
            .iter()
            .filter(|mp| map.get_map_point(**mp).unwrap().replaced_by.is_some())
            .count();
        assert!(merged >= 20);
    }

    #[test]
    fn test_records_loop_and_signals_tracking() {
        let f = fixture(Arc::new(IdleMapping::new()));
        let rig: Arc<dyn RigProjection> = f.scene.rig.clone();
        let optimizer = Arc::new(LmOptimizer::new(rig, Sim3RefineConfig::default(), PoseGraphConfig::default()));
        let corrector = corrector(Arc::clone(&f.matcher), optimizer, 100);
        let (current, matched) = (f.loop_match.current_kf, f.loop_match.matched_kf);

        let report = match corrector.correct(&f.shared, f.loop_match) {
            CorrectionOutcome::Corrected(r) => r,
            CorrectionOutcome::Aborted => panic!("correction aborted"),
        };
        assert!(!report.loop_connections.is_empty());
        assert!(report.pose_graph.is_some());
        assert_eq!(f.signal.times_raised(), 1);
        assert!(!f.shared.mapping.is_paused());

        let map = f.shared.map.read();
        assert!(map.get_keyframe(current).unwrap().loop_edges().contains(&matched));
        assert!(map.get_keyframe(matched).unwrap().loop_edges().contains(&current));
        assert_eq!(map.optimization_epoch(), 1);
        assert_eq!(map.lease_ledger().outstanding(), 0);

        let (dt, dr) = pose_error(&map.get_keyframe(current).unwrap().pose, &f.scene.true_poses[&current]);
        assert!(dt < 1e-3 && dr < 1e-3);
    }

    #[test]
    fn test_aborts_when_mapping_never_pauses() {
        let gate = Arc::new(LocalMappingGate::new());
        let f = fixture(gate.clone());
        let current = f.loop_match.current_kf;
        let before = f.shared.map.read().get_keyframe(current).unwrap().pose.clone();
        let corrector = corrector(Arc::clone(&f.matcher), Arc::new(NoGraphOptimizer::default()), 20);

        assert!(matches!(corrector.correct(&f.shared, f.loop_match), CorrectionOutcome::Aborted));
        assert!(!gate.is_pause_requested());
        assert_eq!(f.signal.times_raised(), 0);

        let map = f.shared.map.read();
        assert_eq!(map.get_keyframe(current).unwrap().pose, before);
        assert!(map.get_keyframe(current).unwrap().loop_edges().is_empty());
        assert_eq!(map.lease_ledger().outstanding(), 0);
        assert_eq!(map.optimization_epoch(), 0);
    }
}
