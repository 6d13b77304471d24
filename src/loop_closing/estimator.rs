//! Geometric verification of loop candidates.
//!
//! Every consistent candidate gets an appearance match against the current
//! keyframe and, if that yields enough correspondences, its own RANSAC
//! solver. Solvers advance round-robin in small batches so a good
//! candidate is found without exhausting the bad ones first. The first
//! solver hypothesis that survives guided matching and nonlinear refinement
//! is checked once more against the whole loop neighbourhood.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::atlas::map::{ErasureLease, KeyFrameId, Map, MapPointId};
use crate::geometry::Sim3;
use crate::matcher::DescriptorMatcher;
use crate::optimizer::sim3_refine::collect_correspondences;
use crate::optimizer::GraphOptimizer;
use crate::tracking::frame::RigProjection;

use super::detector::Detection;
use super::sim3_solver::{Sim3Solver, Sim3SolverConfig, SolverStep};

/// An accepted loop, ready for correction.
///
/// Holds the leases of the current and matched keyframes; every other
/// candidate lease has been released.
#[derive(Debug)]
pub struct LoopMatch {
    pub current_kf: KeyFrameId,
    pub matched_kf: KeyFrameId,
    /// Similarity from the matched keyframe's rig frame to the current one.
    pub s12: Sim3,
    /// Corrected world-to-current similarity pose.
    pub scw: Sim3,
    /// Loop landmark matched to each slot of the current keyframe.
    pub current_matches: Vec<Option<MapPointId>>,
    /// Landmarks of the matched keyframe and its covisible neighbours.
    pub loop_points: Vec<MapPointId>,
    pub current_lease: ErasureLease,
    pub matched_lease: ErasureLease,
}

impl LoopMatch {
    pub fn num_matches(&self) -> usize {
        self.current_matches.iter().flatten().count()
    }
}

/// A candidate still in the running.
struct CandidateState {
    kf: KeyFrameId,
    lease: ErasureLease,
    matches: Vec<Option<MapPointId>>,
    solver: Option<Sim3Solver>,
}

/// Runs RANSAC, guided matching and refinement over the candidates.
pub struct Sim3Estimator {
    rig: Arc<dyn RigProjection>,
    matcher: Arc<dyn DescriptorMatcher>,
    optimizer: Arc<dyn GraphOptimizer>,
    config: Sim3SolverConfig,
    similarity_radius: f64,
    projection_radius: f64,
}

impl Sim3Estimator {
    pub fn new(
        rig: Arc<dyn RigProjection>,
        matcher: Arc<dyn DescriptorMatcher>,
        optimizer: Arc<dyn GraphOptimizer>,
        config: Sim3SolverConfig,
        similarity_radius: f64,
        projection_radius: f64,
    ) -> Self {
        Self {
            rig,
            matcher,
            optimizer,
            config,
            similarity_radius,
            projection_radius,
        }
    }

    /// Verify the candidates of `detection`.
    ///
    /// Returns `None` when no candidate is accepted; all leases, including
    /// the current keyframe's, are released in that case.
    pub fn compute(&self, map: &RwLock<Map>, detection: Detection) -> Option<LoopMatch> {
        let Detection {
            current_kf,
            candidates,
            lease: current_lease,
        } = detection;

        let (accepted, mut current_matches) = {
            let map = map.read();
            let mut states = self.prepare_candidates(&map, current_kf, &candidates);
            self.round_robin(&map, current_kf, &mut states)?
        };
        let (matched_kf, matched_lease, s12) = accepted;

        // Tag the loop neighbourhood; the write lock is held only for tagging.
        let (scw, loop_points) = {
            let mut map = map.write();
            let matched = map.good_keyframe(matched_kf)?;
            let scw = s12.compose(&Sim3::from_se3(&matched.pose_cw()));
            let loop_points = tag_loop_points(&mut map, current_kf, matched_kf);
            (scw, loop_points)
        };

        let total = {
            let map = map.read();
            self.matcher.search_by_projection(
                &map,
                current_kf,
                &scw,
                &loop_points,
                &mut current_matches,
                self.projection_radius,
            );
            current_matches.iter().flatten().count()
        };

        if total < self.config.min_total_matches {
            debug!(
                "[Sim3Estimator] {} ↔ {}: {} matches after projection (< {})",
                current_kf, matched_kf, total, self.config.min_total_matches
            );
            return None;
        }

        info!(
            "[Sim3Estimator] loop accepted {} ↔ {}: scale {:.3}, {} matches, {} loop landmarks",
            current_kf,
            matched_kf,
            s12.scale,
            total,
            loop_points.len()
        );
        Some(LoopMatch {
            current_kf,
            matched_kf,
            s12,
            scw,
            current_matches,
            loop_points,
            current_lease,
            matched_lease,
        })
    }

    /// Lease each candidate and build a solver for those with enough
    /// appearance matches.
    fn prepare_candidates(&self, map: &Map, current_kf: KeyFrameId, candidates: &[KeyFrameId]) -> Vec<CandidateState> {
        let mut states = Vec::new();
        for &kf in candidates {
            let Some(lease) = map.acquire_lease(kf) else {
                debug!("[Sim3Estimator] candidate {} is held by another pass", kf);
                continue;
            };
            if map.good_keyframe(kf).is_none() {
                continue;
            }

            let mut matches = Vec::new();
            let found = self.matcher.search_by_appearance(map, current_kf, kf, &mut matches);
            if found < self.config.min_appearance_matches {
                debug!(
                    "[Sim3Estimator] candidate {}: {} appearance matches (< {})",
                    kf, found, self.config.min_appearance_matches
                );
                continue;
            }

            let correspondences = collect_correspondences(map, current_kf, kf, &matches);
            let solver = Sim3Solver::new(
                Arc::clone(&self.rig),
                correspondences,
                &self.config,
                self.config.seed ^ kf.0,
            );
            states.push(CandidateState {
                kf,
                lease,
                matches,
                solver: Some(solver),
            });
        }
        states
    }

    /// Advance the solvers in turn until one yields a refined, well
    /// supported transform.
    fn round_robin(
        &self,
        map: &Map,
        current_kf: KeyFrameId,
        states: &mut Vec<CandidateState>,
    ) -> Option<((KeyFrameId, ErasureLease, Sim3), Vec<Option<MapPointId>>)> {
        loop {
            let mut any_running = false;
            for idx in 0..states.len() {
                let step = match states[idx].solver.as_mut() {
                    Some(solver) => solver.iterate(self.config.iterations_per_round),
                    None => continue,
                };

                let hypothesis = match step {
                    SolverStep::Found(h) => h,
                    SolverStep::Continue => {
                        any_running = true;
                        continue;
                    }
                    SolverStep::Exhausted => {
                        debug!("[Sim3Estimator] candidate {}: RANSAC exhausted", states[idx].kf);
                        states[idx].solver = None;
                        continue;
                    }
                };
                any_running = true;

                let state = &states[idx];
                let Some(solver) = state.solver.as_ref() else {
                    continue;
                };

                // Keep only the RANSAC inliers, then look for more under the hypothesis.
                let mut matches: Vec<Option<MapPointId>> = vec![None; state.matches.len()];
                for (c, &ok) in solver.correspondences().iter().zip(&hypothesis.inliers) {
                    if ok {
                        if let Some(slot) = matches.get_mut(c.slot1) {
                            *slot = state.matches.get(c.slot1).copied().flatten();
                        }
                    }
                }
                self.matcher.search_by_similarity(
                    map,
                    current_kf,
                    state.kf,
                    &mut matches,
                    &hypothesis.s12,
                    self.similarity_radius,
                );

                let refined = self.optimizer.refine_similarity(
                    map,
                    current_kf,
                    state.kf,
                    &mut matches,
                    &hypothesis.s12,
                    self.config.refine_chi2,
                    self.config.fix_scale,
                );
                match refined {
                    Some(r) if r.inliers >= self.config.min_refined_inliers => {
                        let winner = states.swap_remove(idx);
                        debug!(
                            "[Sim3Estimator] candidate {}: {} RANSAC inliers, {} after refinement",
                            winner.kf, hypothesis.num_inliers, r.inliers
                        );
                        // Remaining candidates release their leases here.
                        states.clear();
                        return Some(((winner.kf, winner.lease, r.s12), matches));
                    }
                    other => {
                        debug!(
                            "[Sim3Estimator] candidate {}: refinement kept {} inliers",
                            state.kf,
                            other.map_or(0, |r| r.inliers)
                        );
                    }
                }
            }

            if !any_running {
                debug!("[Sim3Estimator] {}: no candidate verified", current_kf);
                return None;
            }
        }
    }
}

/// Collect the landmarks of `matched_kf` and its covisible neighbours,
/// tagging each with `current_kf` so it is gathered once.
fn tag_loop_points(map: &mut Map, current_kf: KeyFrameId, matched_kf: KeyFrameId) -> Vec<MapPointId> {
    let Some(matched) = map.good_keyframe(matched_kf) else {
        return Vec::new();
    };
    let mut group = matched.covisibles();
    group.push(matched_kf);

    let mut ids: Vec<MapPointId> = Vec::new();
    for kf_id in group {
        let Some(kf) = map.good_keyframe(kf_id) else {
            continue;
        };
        ids.extend(kf.get_map_point_indices().map(|(_, mp)| mp));
    }

    let mut loop_points = Vec::new();
    for mp_id in ids {
        let Some(mp) = map.get_map_point_mut(mp_id) else {
            continue;
        };
        if mp.is_bad || mp.loop_point_for_kf == Some(current_kf) {
            continue;
        }
        mp.loop_point_for_kf = Some(current_kf);
        loop_points.push(mp_id);
    }
    loop_points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::keyframe_db::KeyFrameDatabase;
    use crate::loop_closing::detector::{LoopDetector, LoopDetectorConfig};
    use crate::simulation::{revisit_scene, revisit_drift, Scene};
    use crate::matcher::{MatcherConfig, RigMatcher};
    use crate::optimizer::{LmOptimizer, PoseGraphConfig, Sim3RefineConfig};
    use approx::assert_relative_eq;

    fn estimator(scene: &Scene) -> Sim3Estimator {
        let rig: Arc<dyn RigProjection> = scene.rig.clone();
        Sim3Estimator::new(
            Arc::clone(&rig),
            Arc::new(RigMatcher::new(Arc::clone(&rig), MatcherConfig::default())),
            Arc::new(LmOptimizer::new(rig, Sim3RefineConfig::default(), PoseGraphConfig::default())),
            Sim3SolverConfig::default(),
            10.0,
            10.0,
        )
    }

    fn detection(scene: &Scene, candidates: Vec<KeyFrameId>) -> Detection {
        let current_kf = scene.revisit[3];
        Detection {
            current_kf,
            candidates,
            lease: scene.map.acquire_lease(current_kf).unwrap(),
        }
    }

    #[test]
    fn test_accepts_revisit_and_recovers_drift() {
        let scene = revisit_scene();
        let est = estimator(&scene);
        let matched = scene.early[4];
        let det = detection(&scene, vec![matched]);
        let map = RwLock::new(scene.map);

        let lm = est.compute(&map, det).expect("loop should be accepted");
        assert_eq!(lm.matched_kf, matched);
        assert!(lm.num_matches() >= 20);

        // Same true pose, so S12 is the drift scale with no relative motion.
        assert_relative_eq!(lm.s12.scale, revisit_drift().scale, epsilon = 1e-3);

        // Without its scale, Scw is the ground-truth pose of the current keyframe.
        let map = map.read();
        let true_cw = scene.true_poses[&lm.current_kf].inverse();
        let rigid = lm.scw.to_rigid();
        assert_relative_eq!(rigid.translation, true_cw.translation, epsilon = 1e-3);
        assert!(rigid.rotation.angle_to(&true_cw.rotation) < 1e-3);

        // Loop landmarks are tagged once and belong to the early segment.
        for mp in &lm.loop_points {
            let mp = map.get_map_point(*mp).unwrap();
            assert_eq!(mp.loop_point_for_kf, Some(lm.current_kf));
        }
        assert!(lm.loop_points.iter().all(|mp| !scene.revisit_points.contains(mp)));
    }

    #[test]
    fn test_rejected_candidates_release_every_lease() {
        let scene = revisit_scene();
        let est = estimator(&scene);
        // Away keyframes share nothing with the current keyframe.
        let det = detection(&scene, scene.away[..3].to_vec());
        let map = RwLock::new(scene.map);

        assert!(est.compute(&map, det).is_none());
        let map = map.read();
        assert_eq!(map.lease_ledger().outstanding(), 0);
        assert_eq!(map.lease_ledger().acquired(), 4);
        assert!(map.keyframes().all(|kf| !kf.protection().is_held()));
    }

    #[test]
    fn test_only_winning_candidate_keeps_its_lease() {
        let scene = revisit_scene();
        let est = estimator(&scene);
        let mut candidates = scene.away[..2].to_vec();
        candidates.push(scene.early[3]);
        candidates.push(scene.early[5]);
        let det = detection(&scene, candidates);
        let map = RwLock::new(scene.map);

        let lm = est.compute(&map, det).expect("loop should be accepted");
        {
            let map = map.read();
            assert_eq!(map.lease_ledger().outstanding(), 2);
            assert!(map.get_keyframe(lm.matched_kf).unwrap().protection().is_held());
        }
        drop(lm);
        assert_eq!(map.read().lease_ledger().outstanding(), 0);
    }

    #[test]
    fn test_busy_candidate_is_discarded() {
        let scene = revisit_scene();
        let est = estimator(&scene);
        let _held = scene.map.acquire_lease(scene.early[4]).unwrap();
        let det = detection(&scene, vec![scene.early[4]]);
        let map = RwLock::new(scene.map);

        assert!(est.compute(&map, det).is_none());
    }

    #[test]
    fn test_detector_and_estimator_together() {
        let scene = revisit_scene();
        let est = estimator(&scene);
        let mut det = LoopDetector::new(Box::new(KeyFrameDatabase::new()), LoopDetectorConfig::default());

        let ids: Vec<KeyFrameId> = scene.map.all_keyframes();
        let map = RwLock::new(scene.map);
        let mut accepted = None;
        for kf in ids.into_iter().skip(1) {
            let detection = det.detect(&map.read(), kf);
            if let Ok(d) = detection {
                accepted = est.compute(&map, d);
                break;
            }
        }

        let lm = accepted.expect("revisit should close a loop");
        assert_eq!(lm.current_kf, scene.revisit[3]);
        assert!(scene.early.contains(&lm.matched_kf));
    }
}
