//! Loop detection using Bag-of-Words with temporal consistency checking.
//!
//! A keyframe only triggers geometric verification if candidates from the
//! place-recognition database keep showing up, in the same covisibility
//! neighbourhood, over consecutive detection cycles.

use std::collections::HashSet;

use serde::Deserialize;
use tracing::{debug, info};

use crate::atlas::keyframe_db::PlaceRecognition;
use crate::atlas::map::{ErasureLease, KeyFrameId, Map};

/// Configuration for loop detection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopDetectorConfig {
    /// Keyframes this close (in id) to the last closed loop are not queried.
    pub cooldown_keyframes: u64,

    /// Consecutive confirmations a candidate group needs.
    pub consistency_threshold: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            cooldown_keyframes: 10,
            consistency_threshold: 3,
        }
    }
}

/// A candidate's covisibility neighbourhood tracked across detection cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistentGroup {
    pub members: HashSet<KeyFrameId>,
    /// Number of consecutive cycles this neighbourhood was confirmed.
    pub consistency: usize,
}

/// A keyframe with candidates that passed the consistency check.
///
/// Holds the erase lease of the query keyframe; dropping the detection
/// releases it.
#[derive(Debug)]
pub struct Detection {
    pub current_kf: KeyFrameId,
    pub candidates: Vec<KeyFrameId>,
    pub lease: ErasureLease,
}

/// Why a keyframe did not produce a [`Detection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoLoop {
    /// Missing or tombstoned keyframe.
    BadKeyFrame,
    /// Another pass holds the keyframe.
    Busy,
    /// Too close to the last closed loop.
    Cooldown,
    /// The database returned nothing above the score floor.
    NoCandidates,
    /// Candidates exist but none is consistent yet.
    NotConsistent,
}

/// Compare this cycle's candidate groups with the previous cycle's.
///
/// `candidate_groups` pairs each candidate with its group (the candidate and
/// its covisible keyframes). A previous group sharing any member passes its
/// counter + 1 on to the candidate's group; every previous group is carried
/// over at most once per cycle. A candidate whose counter reaches
/// `threshold` is reported once. Groups matching nothing start at 0.
///
/// Returns the groups to keep for the next cycle and the consistent
/// candidates.
pub fn update_consistency(
    previous: &[ConsistentGroup],
    candidate_groups: &[(KeyFrameId, HashSet<KeyFrameId>)],
    threshold: usize,
) -> (Vec<ConsistentGroup>, Vec<KeyFrameId>) {
    let mut current: Vec<ConsistentGroup> = Vec::new();
    let mut enough: Vec<KeyFrameId> = Vec::new();
    let mut carried = vec![false; previous.len()];

    for (candidate, group) in candidate_groups {
        let mut consistent_for_some = false;
        let mut reported = false;

        for (i, prev) in previous.iter().enumerate() {
            if prev.members.is_disjoint(group) {
                continue;
            }
            consistent_for_some = true;
            let consistency = prev.consistency + 1;
            if !carried[i] {
                current.push(ConsistentGroup {
                    members: group.clone(),
                    consistency,
                });
                carried[i] = true;
            }
            if consistency >= threshold && !reported {
                enough.push(*candidate);
                reported = true;
            }
        }

        if !consistent_for_some {
            current.push(ConsistentGroup {
                members: group.clone(),
                consistency: 0,
            });
        }
    }

    (current, enough)
}

/// Loop detector: database queries plus the consistency state.
pub struct LoopDetector {
    config: LoopDetectorConfig,
    database: Box<dyn PlaceRecognition>,
    consistent_groups: Vec<ConsistentGroup>,
    /// Cooldown anchor: id of the keyframe that closed the last loop.
    last_loop_kf: KeyFrameId,
}

impl LoopDetector {
    pub fn new(database: Box<dyn PlaceRecognition>, config: LoopDetectorConfig) -> Self {
        Self {
            config,
            database,
            consistent_groups: Vec::new(),
            last_loop_kf: KeyFrameId::new(0),
        }
    }

    pub fn database(&self) -> &dyn PlaceRecognition {
        self.database.as_ref()
    }

    pub fn consistent_groups(&self) -> &[ConsistentGroup] {
        &self.consistent_groups
    }

    pub fn last_loop_keyframe(&self) -> KeyFrameId {
        self.last_loop_kf
    }

    /// Record a closed loop; the cooldown restarts from `kf_id`.
    pub fn set_last_loop(&mut self, kf_id: KeyFrameId) {
        self.last_loop_kf = kf_id;
    }

    /// Forget the consistency state and the cooldown anchor.
    pub fn reset(&mut self) {
        self.consistent_groups.clear();
        self.last_loop_kf = KeyFrameId::new(0);
    }

    /// Run one detection cycle for `kf_id`.
    ///
    /// Every good keyframe is registered in the database, busy or not; on
    /// success the returned [`Detection`] keeps the lease.
    pub fn detect(&mut self, map: &Map, kf_id: KeyFrameId) -> Result<Detection, NoLoop> {
        let Some(kf) = map.good_keyframe(kf_id) else {
            return Err(NoLoop::BadKeyFrame);
        };
        let Some(lease) = map.acquire_lease(kf_id) else {
            debug!("[LoopDetector] {} is held by another pass", kf_id);
            self.database.add(kf);
            return Err(NoLoop::Busy);
        };

        if kf_id.0 < self.last_loop_kf.0 + self.config.cooldown_keyframes {
            self.database.add(kf);
            return Err(NoLoop::Cooldown);
        }

        // The score floor is the worst score among the keyframe's own
        // neighbours: a loop must look at least as similar as they do.
        let min_score = kf
            .covisibles()
            .into_iter()
            .filter_map(|id| map.good_keyframe(id))
            .map(|neighbour| self.database.score(&kf.bow_vector, &neighbour.bow_vector))
            .fold(1.0f64, f64::min);

        let candidates = self.database.detect_loop_candidates(map, kf_id, min_score);
        if candidates.is_empty() {
            self.database.add(kf);
            self.consistent_groups.clear();
            debug!("[LoopDetector] {}: no candidates above {:.3}", kf_id, min_score);
            return Err(NoLoop::NoCandidates);
        }

        let candidate_groups: Vec<(KeyFrameId, HashSet<KeyFrameId>)> = candidates
            .iter()
            .map(|&cand| {
                let mut group: HashSet<KeyFrameId> = map
                    .get_keyframe(cand)
                    .map(|c| c.covisibles().into_iter().collect())
                    .unwrap_or_default();
                group.insert(cand);
                (cand, group)
            })
            .collect();

        let (groups, enough) =
            update_consistency(&self.consistent_groups, &candidate_groups, self.config.consistency_threshold);
        self.consistent_groups = groups;
        self.database.add(kf);

        if enough.is_empty() {
            debug!(
                "[LoopDetector] {}: {} candidates, none consistent yet",
                kf_id,
                candidates.len()
            );
            return Err(NoLoop::NotConsistent);
        }

        info!(
            "[LoopDetector] {}: {} consistent candidates {:?}",
            kf_id,
            enough.len(),
            enough
        );
        Ok(Detection {
            current_kf: kf_id,
            candidates: enough,
            lease,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::keyframe_db::KeyFrameDatabase;
    use crate::simulation::{revisit_scene, straight_scene};

    fn ids(v: &[u64]) -> HashSet<KeyFrameId> {
        v.iter().map(|&i| KeyFrameId::new(i)).collect()
    }

    fn detector() -> LoopDetector {
        LoopDetector::new(Box::new(KeyFrameDatabase::new()), LoopDetectorConfig::default())
    }

    #[test]
    fn test_single_cycle_never_consistent() {
        let groups = vec![(KeyFrameId::new(3), ids(&[2, 3, 4]))];
        let (kept, enough) = update_consistency(&[], &groups, 3);
        assert!(enough.is_empty());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].consistency, 0);
    }

    #[test]
    fn test_overlapping_groups_become_consistent() {
        let mut state = Vec::new();
        // The neighbourhood drifts a little between cycles but always overlaps.
        let cycles = [ids(&[2, 3, 4]), ids(&[3, 4, 5]), ids(&[4, 5, 6]), ids(&[5, 6, 7])];
        let mut reported = Vec::new();
        for (i, group) in cycles.iter().enumerate() {
            let cand = KeyFrameId::new(4 + i as u64);
            let (next, enough) = update_consistency(&state, &[(cand, group.clone())], 3);
            state = next;
            reported.push(enough);
        }

        // First sighting plus three confirmations.
        assert!(reported[..3].iter().all(|e| e.is_empty()));
        assert_eq!(reported[3], vec![KeyFrameId::new(7)]);
        assert_eq!(state[0].consistency, 3);
    }

    #[test]
    fn test_disjoint_group_restarts_count() {
        let previous = vec![ConsistentGroup {
            members: ids(&[1, 2]),
            consistency: 2,
        }];
        let (kept, enough) = update_consistency(&previous, &[(KeyFrameId::new(9), ids(&[8, 9]))], 3);
        assert!(enough.is_empty());
        assert_eq!(kept[0].consistency, 0);
    }

    #[test]
    fn test_previous_group_carried_once() {
        let previous = vec![ConsistentGroup {
            members: ids(&[1, 2, 3]),
            consistency: 2,
        }];
        let candidates = vec![(KeyFrameId::new(1), ids(&[1, 2])), (KeyFrameId::new(3), ids(&[3, 4]))];
        let (kept, enough) = update_consistency(&previous, &candidates, 3);

        // Both candidates are consistent, but only one group is carried over.
        assert_eq!(enough, vec![KeyFrameId::new(1), KeyFrameId::new(3)]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].consistency, 3);
    }

    #[test]
    fn test_cooldown_registers_and_releases() {
        let scene = straight_scene(4);
        let mut det = detector();
        let kf = scene.away[2];

        assert_eq!(det.detect(&scene.map, kf).unwrap_err(), NoLoop::Cooldown);
        assert_eq!(det.database().len(), 1);
        assert!(!scene.map.get_keyframe(kf).unwrap().protection().is_held());
        assert_eq!(scene.map.lease_ledger().outstanding(), 0);
    }

    #[test]
    fn test_busy_keyframe_is_skipped() {
        let scene = straight_scene(12);
        let mut det = detector();
        let kf = scene.away[11];
        let _held = scene.map.acquire_lease(kf).unwrap();

        assert_eq!(det.detect(&scene.map, kf).unwrap_err(), NoLoop::Busy);
        // Still registered, so later keyframes can find it.
        assert_eq!(det.database().len(), 1);
        assert_eq!(det.consistent_groups().len(), 0);
    }

    #[test]
    fn test_revisit_is_detected_after_consistent_cycles() {
        let scene = revisit_scene();
        let mut det = detector();

        for &kf in scene.early.iter().chain(&scene.away).skip(1) {
            assert!(det.detect(&scene.map, kf).is_err());
        }
        assert!(det.consistent_groups().is_empty());

        let mut outcomes = Vec::new();
        for &kf in &scene.revisit {
            outcomes.push(det.detect(&scene.map, kf));
            if outcomes.last().map_or(false, |o| o.is_ok()) {
                break;
            }
        }

        assert_eq!(outcomes.len(), 4);
        for o in &outcomes[..3] {
            assert_eq!(o.as_ref().unwrap_err(), &NoLoop::NotConsistent);
        }
        let detection = outcomes.pop().unwrap().unwrap();
        assert_eq!(detection.current_kf, scene.revisit[3]);
        assert!(!detection.candidates.is_empty());
        assert!(detection.candidates.iter().all(|c| scene.early.contains(c)));

        // The lease travels with the detection.
        assert!(scene.map.get_keyframe(scene.revisit[3]).unwrap().protection().is_held());
        drop(detection);
        assert_eq!(scene.map.lease_ledger().outstanding(), 0);
    }

    #[test]
    fn test_reset_restarts_cooldown_and_consistency() {
        let mut det = detector();
        det.set_last_loop(KeyFrameId::new(40));
        det.consistent_groups.push(ConsistentGroup {
            members: ids(&[1]),
            consistency: 1,
        });
        det.reset();
        assert_eq!(det.last_loop_keyframe(), KeyFrameId::new(0));
        assert!(det.consistent_groups().is_empty());
    }
}
