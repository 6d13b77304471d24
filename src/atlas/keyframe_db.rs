//! KeyFrameDatabase - inverted-index place recognition database.
//!
//! Each KeyFrame is summarised by a sparse Bag-of-Words vector. The database
//! keeps, for every visual word, the list of KeyFrames containing it, so a
//! loop query only scores KeyFrames that share words with the query.
//!
//! Loop candidate retrieval follows the usual DBoW scheme:
//! 1. Collect KeyFrames sharing words with the query, excluding the ones
//!    already connected to it in the covisibility graph.
//! 2. Keep those sharing more than 80% of the best word count and scoring at
//!    least the caller's floor.
//! 3. Accumulate scores over each candidate's covisibility neighbourhood and
//!    return the best KeyFrame of every group above 75% of the best group.

use std::collections::{HashMap, HashSet};

use crate::atlas::map::{KeyFrame, KeyFrameId, Map};

/// Bag-of-Words vector: word_id -> weight.
pub type BowVector = HashMap<u32, f64>;

/// Covisible neighbours considered when accumulating group scores.
const GROUP_NEIGHBOURS: usize = 10;

/// Appearance-based retrieval of loop candidates.
pub trait PlaceRecognition: Send {
    /// Register a KeyFrame so later queries can retrieve it.
    fn add(&mut self, kf: &KeyFrame);

    /// KeyFrames that look like `kf_id` with a score of at least `min_score`,
    /// excluding KeyFrames covisible with it.
    fn detect_loop_candidates(&self, map: &Map, kf_id: KeyFrameId, min_score: f64) -> Vec<KeyFrameId>;

    /// Similarity of two appearance vectors in [0, 1].
    fn score(&self, a: &BowVector, b: &BowVector) -> f64;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

/// Inverted-index KeyFrame database with L1 scoring.
#[derive(Debug, Default)]
pub struct KeyFrameDatabase {
    /// word_id -> KeyFrames containing that word.
    inverted_index: HashMap<u32, Vec<KeyFrameId>>,

    /// Registered KeyFrames and their (L1-normalised) vectors.
    entries: HashMap<KeyFrameId, BowVector>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a KeyFrame from the database.
    pub fn erase(&mut self, kf_id: KeyFrameId) {
        let Some(bow) = self.entries.remove(&kf_id) else {
            return;
        };
        for word in bow.keys() {
            if let Some(list) = self.inverted_index.get_mut(word) {
                list.retain(|id| *id != kf_id);
                if list.is_empty() {
                    self.inverted_index.remove(word);
                }
            }
        }
    }

    pub fn contains(&self, kf_id: KeyFrameId) -> bool {
        self.entries.contains_key(&kf_id)
    }
}

fn l1_normalized(v: &BowVector) -> BowVector {
    let norm: f64 = v.values().map(|w| w.abs()).sum();
    if norm <= 0.0 {
        return BowVector::new();
    }
    v.iter().map(|(k, w)| (*k, w / norm)).collect()
}

impl PlaceRecognition for KeyFrameDatabase {
    fn add(&mut self, kf: &KeyFrame) {
        if self.entries.contains_key(&kf.id) {
            return;
        }
        for word in kf.bow_vector.keys() {
            self.inverted_index.entry(*word).or_default().push(kf.id);
        }
        self.entries.insert(kf.id, l1_normalized(&kf.bow_vector));
    }

    fn detect_loop_candidates(&self, map: &Map, kf_id: KeyFrameId, min_score: f64) -> Vec<KeyFrameId> {
        let Some(kf) = map.good_keyframe(kf_id) else {
            return Vec::new();
        };

        let mut connected: HashSet<KeyFrameId> = kf.covisibles().into_iter().collect();
        connected.insert(kf_id);

        // Words shared with the query, per unconnected KeyFrame.
        let mut common_words: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in kf.bow_vector.keys() {
            let Some(list) = self.inverted_index.get(word) else {
                continue;
            };
            for other in list {
                if connected.contains(other) || map.good_keyframe(*other).is_none() {
                    continue;
                }
                *common_words.entry(*other).or_insert(0) += 1;
            }
        }

        let Some(&max_common) = common_words.values().max() else {
            return Vec::new();
        };
        let min_common = (0.8 * max_common as f64) as usize;

        // Score every KeyFrame sharing enough words. Scores below the floor
        // still contribute to their neighbours' group scores.
        let mut scores: HashMap<KeyFrameId, f64> = HashMap::new();
        let mut matches: Vec<(f64, KeyFrameId)> = Vec::new();
        for (&other, &common) in &common_words {
            if common <= min_common {
                continue;
            }
            let Some(other_bow) = self.entries.get(&other) else {
                continue;
            };
            let s = self.score(&kf.bow_vector, other_bow);
            scores.insert(other, s);
            if s >= min_score {
                matches.push((s, other));
            }
        }
        if matches.is_empty() {
            return Vec::new();
        }

        // Accumulate over covisibility groups.
        let mut groups: Vec<(f64, KeyFrameId)> = Vec::with_capacity(matches.len());
        let mut best_acc = 0.0f64;
        for (score, cand) in &matches {
            let Some(cand_kf) = map.good_keyframe(*cand) else {
                continue;
            };
            let mut acc = *score;
            let mut best = (*score, *cand);
            for neigh in cand_kf.get_best_covisibles(GROUP_NEIGHBOURS) {
                if let Some(&s) = scores.get(&neigh) {
                    acc += s;
                    if s > best.0 {
                        best = (s, neigh);
                    }
                }
            }
            groups.push((acc, best.1));
            best_acc = best_acc.max(acc);
        }

        let min_retain = 0.75 * best_acc;
        let mut result: Vec<KeyFrameId> = groups
            .into_iter()
            .filter(|(acc, _)| *acc > min_retain)
            .map(|(_, id)| id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        result.sort();
        result
    }

    fn score(&self, a: &BowVector, b: &BowVector) -> f64 {
        let a = l1_normalized(a);
        let b = l1_normalized(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let mut diff = 0.0;
        for (word, wa) in &a {
            diff += (wa - b.get(word).copied().unwrap_or(0.0)).abs();
        }
        for (word, wb) in &b {
            if !a.contains_key(word) {
                diff += wb.abs();
            }
        }
        (1.0 - 0.5 * diff).clamp(0.0, 1.0)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.inverted_index.clear();
        self.entries.clear();
    }
}
