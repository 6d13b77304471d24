//! Optimization module for loop closing.
//!
//! Implements:
//! - Sim3 refinement between two keyframes (Levenberg-Marquardt)
//! - Essential graph optimization after a loop correction
//!
//! The pipeline talks to the optimizer through [`GraphOptimizer`];
//! [`LmOptimizer`] is the reference implementation.

pub mod pose_graph;
pub mod sim3_refine;

pub use pose_graph::{
    optimize_essential_graph, KeyFrameAndPose, LoopConnections, PoseGraphConfig, PoseGraphResult,
};
pub use sim3_refine::{refine_sim3, Sim3RefineConfig, Sim3Refinement};

use std::sync::Arc;

use parking_lot::RwLock;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::Sim3;
use crate::tracking::frame::RigProjection;

/// Nonlinear optimization used by loop detection and correction.
pub trait GraphOptimizer: Send + Sync {
    /// Refine `s12` (keyframe 2 → keyframe 1) over `matches` (slots of
    /// `kf1`). Outlier matches are cleared. `th2` is the chi² inlier
    /// threshold of a single reprojection.
    #[allow(clippy::too_many_arguments)]
    fn refine_similarity(
        &self,
        map: &Map,
        kf1: KeyFrameId,
        kf2: KeyFrameId,
        matches: &mut [Option<MapPointId>],
        s12: &Sim3,
        th2: f64,
        fix_scale: bool,
    ) -> Option<Sim3Refinement>;

    /// Optimize the essential graph after a loop correction and move every
    /// landmark with its reference keyframe.
    #[allow(clippy::too_many_arguments)]
    fn optimize_pose_graph(
        &self,
        map: &RwLock<Map>,
        loop_kf: KeyFrameId,
        current_kf: KeyFrameId,
        scw: &Sim3,
        non_corrected: &KeyFrameAndPose,
        corrected: &KeyFrameAndPose,
        loop_connections: &LoopConnections,
    ) -> Option<PoseGraphResult>;
}

/// Levenberg-Marquardt backed [`GraphOptimizer`].
pub struct LmOptimizer {
    rig: Arc<dyn RigProjection>,
    sim3: Sim3RefineConfig,
    pose_graph: PoseGraphConfig,
}

impl LmOptimizer {
    pub fn new(rig: Arc<dyn RigProjection>, sim3: Sim3RefineConfig, pose_graph: PoseGraphConfig) -> Self {
        Self { rig, sim3, pose_graph }
    }
}

impl GraphOptimizer for LmOptimizer {
    fn refine_similarity(
        &self,
        map: &Map,
        kf1: KeyFrameId,
        kf2: KeyFrameId,
        matches: &mut [Option<MapPointId>],
        s12: &Sim3,
        th2: f64,
        fix_scale: bool,
    ) -> Option<Sim3Refinement> {
        let correspondences = sim3_refine::collect_correspondences(map, kf1, kf2, matches);

        // Matches that cannot be expressed as a correspondence are dropped.
        let usable: std::collections::HashSet<usize> = correspondences.iter().map(|c| c.slot1).collect();
        for (slot, m) in matches.iter_mut().enumerate() {
            if !usable.contains(&slot) {
                *m = None;
            }
        }

        let (refined, inliers) =
            refine_sim3(self.rig.as_ref(), &correspondences, s12, th2, fix_scale, &self.sim3)?;

        let mut count = 0;
        for (c, ok) in correspondences.iter().zip(&inliers) {
            if *ok {
                count += 1;
            } else if let Some(m) = matches.get_mut(c.slot1) {
                *m = None;
            }
        }

        Some(Sim3Refinement {
            s12: refined,
            inliers: count,
        })
    }

    fn optimize_pose_graph(
        &self,
        map: &RwLock<Map>,
        loop_kf: KeyFrameId,
        current_kf: KeyFrameId,
        _scw: &Sim3,
        non_corrected: &KeyFrameAndPose,
        corrected: &KeyFrameAndPose,
        loop_connections: &LoopConnections,
    ) -> Option<PoseGraphResult> {
        // The loop transform already enters through the corrected poses.
        optimize_essential_graph(
            map,
            loop_kf,
            current_kf,
            non_corrected,
            corrected,
            loop_connections,
            &self.pose_graph,
        )
    }
}
