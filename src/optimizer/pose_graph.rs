//! Pose Graph Optimization for Loop Closing.
//!
//! Optimizes the Essential Graph (spanning tree + loop edges + strong
//! covisibility + the new loop connections) using Sim3 constraints, then
//! moves every landmark with the keyframe its position is referenced to.
//!
//! This module uses the three-phase pattern:
//! 1. COLLECT: Extract poses and edges from the map (read lock)
//! 2. SOLVE: Run LM optimization without locks
//! 3. APPLY: Write back optimized poses and landmarks (write lock)

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use crate::atlas::map::{KeyFrameId, Map};
use crate::geometry::Sim3;

/// Similarity pose (world → keyframe) per keyframe.
pub type KeyFrameAndPose = HashMap<KeyFrameId, Sim3>;

/// New covisibility links created by a loop correction, per keyframe.
pub type LoopConnections = HashMap<KeyFrameId, HashSet<KeyFrameId>>;

/// Configuration for pose graph optimization.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoseGraphConfig {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,

    /// Convergence threshold on parameter change.
    pub param_tolerance: f64,

    /// Convergence threshold on gradient norm.
    pub gradient_tolerance: f64,

    /// Minimum covisibility weight to include as edge.
    pub min_covisibility_weight: usize,

    /// Whether to fix scale (true for rigs with metric depth).
    pub fix_scale: bool,
}

impl Default for PoseGraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            param_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            min_covisibility_weight: 100,
            fix_scale: false,
        }
    }
}

/// A pose graph edge (constraint between two keyframes).
#[derive(Debug, Clone)]
pub struct PoseGraphEdge {
    pub kf_id_i: KeyFrameId,
    pub kf_id_j: KeyFrameId,

    /// Measured S_ji = S_jw · S_iw⁻¹.
    pub measurement: Sim3,

    /// Information weight (inverse covariance).
    pub information: f64,

    pub edge_type: EdgeType,
}

/// Type of pose graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    /// Spanning tree edge.
    SpanningTree,
    /// Permanent loop edge from an earlier correction.
    LoopEdge,
    /// Link created by the current loop correction.
    LoopConnection,
    /// Strong covisibility edge.
    Covisibility,
}

/// Data extracted for pose graph optimization.
pub struct PoseGraphProblemData {
    /// Keyframe IDs in optimization order.
    pub kf_ids: Vec<KeyFrameId>,

    /// Initial S_iw for each keyframe.
    pub initial_poses: HashMap<KeyFrameId, Sim3>,

    pub edges: Vec<PoseGraphEdge>,

    /// ID of fixed keyframe (the loop keyframe).
    pub fixed_kf_id: KeyFrameId,

    pub fix_scale: bool,
}

/// Result of pose graph optimization.
#[derive(Debug)]
pub struct PoseGraphResult {
    /// Optimized S_iw.
    pub optimized_poses: HashMap<KeyFrameId, Sim3>,

    pub iterations: usize,
    pub num_edges: usize,

    pub initial_error: f64,
    pub final_error: f64,

    /// Landmarks moved during APPLY.
    pub landmarks_moved: usize,
}

/// Run all three phases on a shared map.
///
/// Mapping must be paused by the caller; the write lock is only held for
/// the APPLY phase.
#[allow(clippy::too_many_arguments)]
pub fn optimize_essential_graph(
    map: &RwLock<Map>,
    loop_kf_id: KeyFrameId,
    current_kf_id: KeyFrameId,
    non_corrected: &KeyFrameAndPose,
    corrected: &KeyFrameAndPose,
    loop_connections: &LoopConnections,
    config: &PoseGraphConfig,
) -> Option<PoseGraphResult> {
    let problem = {
        let map = map.read();
        collect_pose_graph_data(&map, loop_kf_id, current_kf_id, non_corrected, corrected, loop_connections, config)?
    };

    let mut result = solve_pose_graph(&problem, config)?;

    {
        let mut map = map.write();
        result.landmarks_moved = apply_pose_graph_results(&mut map, &problem, &result, current_kf_id);
    }

    info!(
        "[PoseGraph] {} keyframes, {} edges, error {:.4} → {:.4} in {} iterations, {} landmarks moved",
        problem.kf_ids.len(),
        result.num_edges,
        result.initial_error,
        result.final_error,
        result.iterations,
        result.landmarks_moved
    );
    Some(result)
}

/// PHASE 1: Collect pose graph data from the map.
#[allow(clippy::too_many_arguments)]
pub fn collect_pose_graph_data(
    map: &Map,
    loop_kf_id: KeyFrameId,
    current_kf_id: KeyFrameId,
    non_corrected: &KeyFrameAndPose,
    corrected: &KeyFrameAndPose,
    loop_connections: &LoopConnections,
    config: &PoseGraphConfig,
) -> Option<PoseGraphProblemData> {
    map.good_keyframe(loop_kf_id)?;

    let kf_ids = map.all_keyframes();
    let mut initial_poses: HashMap<KeyFrameId, Sim3> = HashMap::new();
    for &kf_id in &kf_ids {
        let kf = map.get_keyframe(kf_id)?;
        let siw = corrected
            .get(&kf_id)
            .cloned()
            .unwrap_or_else(|| Sim3::from_se3(&kf.pose_cw()));
        initial_poses.insert(kf_id, siw);
    }

    // Poses before correction, used as measurements for the old graph.
    let uncorrected = |kf_id: KeyFrameId| -> Option<Sim3> {
        non_corrected
            .get(&kf_id)
            .cloned()
            .or_else(|| initial_poses.get(&kf_id).cloned())
    };

    let mut edges = Vec::new();
    let mut inserted: HashSet<(KeyFrameId, KeyFrameId)> = HashSet::new();
    let key = |a: KeyFrameId, b: KeyFrameId| (a.min(b), a.max(b));

    // Loop connections, measured with the corrected poses.
    for (&i, connected) in loop_connections {
        let Some(siw) = initial_poses.get(&i) else {
            continue;
        };
        let Some(kf_i) = map.good_keyframe(i) else {
            continue;
        };
        let swi = siw.inverse();
        for &j in connected {
            let is_loop_pair = i == current_kf_id && j == loop_kf_id;
            if !is_loop_pair && kf_i.get_covisibility_weight(j) < config.min_covisibility_weight {
                continue;
            }
            let Some(sjw) = initial_poses.get(&j) else {
                continue;
            };
            edges.push(PoseGraphEdge {
                kf_id_i: i,
                kf_id_j: j,
                measurement: sjw.compose(&swi),
                information: 1.0,
                edge_type: EdgeType::LoopConnection,
            });
            inserted.insert(key(i, j));
        }
    }

    for &i in &kf_ids {
        let Some(kf) = map.get_keyframe(i) else {
            continue;
        };
        let Some(swi) = uncorrected(i).map(|s| s.inverse()) else {
            continue;
        };
        let push_edge = |j: KeyFrameId, edge_type: EdgeType, edges: &mut Vec<PoseGraphEdge>| {
            if let Some(sjw) = uncorrected(j) {
                edges.push(PoseGraphEdge {
                    kf_id_i: i,
                    kf_id_j: j,
                    measurement: sjw.compose(&swi),
                    information: 1.0,
                    edge_type,
                });
            }
        };

        // Spanning tree edge
        if let Some(parent) = kf.parent_id.filter(|p| initial_poses.contains_key(p)) {
            push_edge(parent, EdgeType::SpanningTree, &mut edges);
        }

        // Permanent loop edges, once per pair
        for &j in kf.loop_edges() {
            if j < i && initial_poses.contains_key(&j) {
                push_edge(j, EdgeType::LoopEdge, &mut edges);
            }
        }

        // Strong covisibility edges not already covered
        for j in kf.get_covisibles_above_weight(config.min_covisibility_weight) {
            if j >= i
                || Some(j) == kf.parent_id
                || kf.children_ids.contains(&j)
                || kf.loop_edges().contains(&j)
                || inserted.contains(&key(i, j))
                || !initial_poses.contains_key(&j)
            {
                continue;
            }
            push_edge(j, EdgeType::Covisibility, &mut edges);
        }
    }

    debug!(
        "[PoseGraph] collected {} keyframes and {} edges",
        kf_ids.len(),
        edges.len()
    );

    Some(PoseGraphProblemData {
        kf_ids,
        initial_poses,
        edges,
        fixed_kf_id: loop_kf_id,
        fix_scale: config.fix_scale,
    })
}

/// Index bookkeeping shared by the error and Jacobian evaluations.
struct Layout<'a> {
    kf_to_idx: HashMap<KeyFrameId, usize>,
    idx_to_param: HashMap<usize, usize>,
    fixed_idx: usize,
    fixed_pose: &'a Sim3,
    params_per_pose: usize,
}

impl Layout<'_> {
    fn pose(&self, params: &DVector<f64>, idx: usize) -> Sim3 {
        self.pose_with(params, idx, None)
    }

    /// Pose of vertex `idx`, optionally with one parameter perturbed.
    fn pose_with(&self, params: &DVector<f64>, idx: usize, perturb: Option<(usize, f64)>) -> Sim3 {
        if idx == self.fixed_idx {
            return self.fixed_pose.clone();
        }
        let offset = self.idx_to_param[&idx] * self.params_per_pose;
        let mut tangent = [0.0; 7];
        for (i, t) in tangent.iter_mut().enumerate().take(self.params_per_pose) {
            *t = params[offset + i];
        }
        if let Some((p, eps)) = perturb {
            tangent[p] += eps;
        }
        Sim3::exp(&tangent)
    }
}

/// Edge error: log(S_ji · S_iw · S_jw⁻¹).
fn edge_error(edge: &PoseGraphEdge, siw: &Sim3, sjw: &Sim3) -> [f64; 7] {
    edge.measurement.compose(siw).compose(&sjw.inverse()).log()
}

fn total_error(params: &DVector<f64>, edges: &[PoseGraphEdge], layout: &Layout) -> f64 {
    edges
        .iter()
        .map(|edge| {
            let siw = layout.pose(params, layout.kf_to_idx[&edge.kf_id_i]);
            let sjw = layout.pose(params, layout.kf_to_idx[&edge.kf_id_j]);
            let err = edge_error(edge, &siw, &sjw);
            let sq: f64 = err.iter().take(layout.params_per_pose).map(|e| e * e).sum();
            sq * edge.information
        })
        .sum()
}

fn residuals_and_jacobian(
    params: &DVector<f64>,
    edges: &[PoseGraphEdge],
    layout: &Layout,
) -> (DVector<f64>, DMatrix<f64>) {
    let ppp = layout.params_per_pose;
    let mut residuals = DVector::zeros(edges.len() * ppp);
    let mut jacobian = DMatrix::zeros(edges.len() * ppp, params.len());
    let eps = 1e-6;

    for (edge_idx, edge) in edges.iter().enumerate() {
        let idx_i = layout.kf_to_idx[&edge.kf_id_i];
        let idx_j = layout.kf_to_idx[&edge.kf_id_j];
        let siw = layout.pose(params, idx_i);
        let sjw = layout.pose(params, idx_j);
        let weight_sqrt = edge.information.sqrt();
        let row = edge_idx * ppp;

        let err = edge_error(edge, &siw, &sjw);
        for r in 0..ppp {
            residuals[row + r] = err[r] * weight_sqrt;
        }

        // Numerical Jacobian w.r.t. both endpoints
        for (vertex, is_i) in [(idx_i, true), (idx_j, false)] {
            if vertex == layout.fixed_idx {
                continue;
            }
            let col = layout.idx_to_param[&vertex] * ppp;
            for p in 0..ppp {
                let plus = layout.pose_with(params, vertex, Some((p, eps)));
                let minus = layout.pose_with(params, vertex, Some((p, -eps)));
                let (err_plus, err_minus) = if is_i {
                    (edge_error(edge, &plus, &sjw), edge_error(edge, &minus, &sjw))
                } else {
                    (edge_error(edge, &siw, &plus), edge_error(edge, &siw, &minus))
                };
                for r in 0..ppp {
                    jacobian[(row + r, col + p)] += (err_plus[r] - err_minus[r]) / (2.0 * eps) * weight_sqrt;
                }
            }
        }
    }

    (residuals, jacobian)
}

/// PHASE 2: Solve pose graph optimization.
pub fn solve_pose_graph(problem: &PoseGraphProblemData, config: &PoseGraphConfig) -> Option<PoseGraphResult> {
    let n_poses = problem.kf_ids.len();
    if n_poses < 2 || problem.edges.is_empty() {
        return None;
    }

    let kf_to_idx: HashMap<KeyFrameId, usize> = problem
        .kf_ids
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();
    let fixed_idx = *kf_to_idx.get(&problem.fixed_kf_id)?;
    let fixed_pose = problem.initial_poses.get(&problem.fixed_kf_id)?;

    // Number of parameters per pose (6 with fixed scale, 7 for Sim3)
    let params_per_pose = if problem.fix_scale { 6 } else { 7 };

    let mut idx_to_param: HashMap<usize, usize> = HashMap::new();
    for kf_idx in (0..n_poses).filter(|&i| i != fixed_idx) {
        let next = idx_to_param.len();
        idx_to_param.insert(kf_idx, next);
    }
    let n_params = idx_to_param.len() * params_per_pose;

    let layout = Layout {
        kf_to_idx,
        idx_to_param,
        fixed_idx,
        fixed_pose,
        params_per_pose,
    };

    let mut params = DVector::zeros(n_params);
    for (kf_idx, kf_id) in problem.kf_ids.iter().enumerate() {
        if kf_idx == fixed_idx {
            continue;
        }
        let offset = layout.idx_to_param[&kf_idx] * params_per_pose;
        let tangent = problem.initial_poses.get(kf_id)?.log();
        for i in 0..params_per_pose {
            params[offset + i] = tangent[i];
        }
    }

    let initial_error = total_error(&params, &problem.edges, &layout);

    // LM optimization
    let mut current_params = params;
    let mut current_error = initial_error;
    let mut lambda = 1e-3;
    let lambda_up = 10.0;
    let lambda_down = 0.1;
    let min_lambda = 1e-10;
    let max_lambda = 1e10;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;

        let (residuals, jacobian) = residuals_and_jacobian(&current_params, &problem.edges, &layout);

        let gradient = jacobian.transpose() * &residuals;
        if gradient.norm() < config.gradient_tolerance {
            break;
        }
        let jtj = jacobian.transpose() * &jacobian;

        // Damped system
        let mut damped = jtj;
        for i in 0..n_params {
            damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
        }

        let Some(delta) = damped.lu().solve(&(-&gradient)) else {
            break;
        };

        if delta.norm() < config.param_tolerance * (current_params.norm() + config.param_tolerance) {
            break;
        }

        // Trial step
        let trial_params = &current_params + &delta;
        let trial_error = total_error(&trial_params, &problem.edges, &layout);

        if trial_error < current_error {
            current_params = trial_params;
            current_error = trial_error;
            lambda = (lambda * lambda_down).max(min_lambda);
        } else {
            lambda = (lambda * lambda_up).min(max_lambda);
        }
    }

    let optimized_poses = problem
        .kf_ids
        .iter()
        .enumerate()
        .map(|(kf_idx, &kf_id)| (kf_id, layout.pose(&current_params, kf_idx)))
        .collect();

    Some(PoseGraphResult {
        optimized_poses,
        iterations,
        num_edges: problem.edges.len(),
        initial_error: initial_error.sqrt(),
        final_error: current_error.sqrt(),
        landmarks_moved: 0,
    })
}

/// PHASE 3: Apply optimized poses and move landmarks with their reference
/// keyframe. Returns the number of landmarks moved.
pub fn apply_pose_graph_results(
    map: &mut Map,
    problem: &PoseGraphProblemData,
    results: &PoseGraphResult,
    current_kf_id: KeyFrameId,
) -> usize {
    for (kf_id, siw) in &results.optimized_poses {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            if !kf.is_bad {
                kf.pose = siw.to_rigid().inverse();
            }
        }
    }

    // p' = S_rw(optimized)⁻¹ · S_rw(initial) · p for the reference keyframe r.
    let moves: Vec<_> = map
        .map_points()
        .filter(|mp| !mp.is_bad)
        .filter_map(|mp| {
            let reference = if mp.corrected_by_kf == Some(current_kf_id) {
                mp.corrected_reference?
            } else {
                mp.reference_kf
            };
            let before = problem.initial_poses.get(&reference)?;
            let after = results.optimized_poses.get(&reference)?;
            let p = after.inverse().transform_point(&before.transform_point(&mp.position));
            Some((mp.id, p))
        })
        .collect();

    let moved = moves.len();
    for (mp_id, position) in moves {
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = position;
        }
        map.update_map_point_normal_and_depth(mp_id);
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::keyframe_db::BowVector;
    use crate::geometry::SE3;
    use nalgebra::{UnitQuaternion, Vector3};

    /// A chain of keyframes along x with a drifted tail, closed by a loop
    /// between the last and the first keyframe.
    fn drifted_chain(n: usize) -> (Map, Vec<KeyFrameId>) {
        let mut map = Map::new();
        let mut ids: Vec<KeyFrameId> = Vec::new();
        for i in 0..n {
            let pose = SE3 {
                rotation: UnitQuaternion::identity(),
                translation: Vector3::new(i as f64, 0.02 * (i * i) as f64, 0.0),
            };
            let id = map.create_keyframe(i as u64, pose, Vec::new(), BowVector::new());
            if let Some(&prev) = ids.last() {
                map.get_keyframe_mut(id).unwrap().set_parent(prev);
                map.get_keyframe_mut(prev).unwrap().add_child(id);
            }
            ids.push(id);
        }
        (map, ids)
    }

    #[test]
    fn test_config_default() {
        let config = PoseGraphConfig::default();
        assert_eq!(config.max_iterations, 20);
        assert_eq!(config.min_covisibility_weight, 100);
        assert!(!config.fix_scale);
    }

    #[test]
    fn test_collect_uses_corrected_poses_and_fixes_loop_kf() {
        let (map, ids) = drifted_chain(5);
        let current = ids[4];
        let loop_kf = ids[0];

        let mut corrected = KeyFrameAndPose::new();
        let corrected_pose = Sim3::from_se3(&SE3::identity());
        corrected.insert(current, corrected_pose.clone());
        let mut non_corrected = KeyFrameAndPose::new();
        non_corrected.insert(current, Sim3::from_se3(&map.get_keyframe(current).unwrap().pose_cw()));
        let mut connections = LoopConnections::new();
        connections.insert(current, [loop_kf].into_iter().collect());

        let data = collect_pose_graph_data(
            &map,
            loop_kf,
            current,
            &non_corrected,
            &corrected,
            &connections,
            &PoseGraphConfig::default(),
        )
        .unwrap();

        assert_eq!(data.fixed_kf_id, loop_kf);
        assert_eq!(data.initial_poses[&current], corrected_pose);
        let spanning = data.edges.iter().filter(|e| e.edge_type == EdgeType::SpanningTree).count();
        assert_eq!(spanning, 4);
        assert!(data
            .edges
            .iter()
            .any(|e| e.edge_type == EdgeType::LoopConnection && e.kf_id_i == current));
    }

    #[test]
    fn test_optimization_reduces_error_and_moves_landmarks() {
        let (map, ids) = drifted_chain(6);
        let current = ids[5];
        let loop_kf = ids[0];

        // The loop says the current keyframe sits 5 m from the origin with no
        // lateral offset.
        let true_current = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(5.0, 0.0, 0.0),
        };
        let mut map = map;
        let mp = map.create_map_point(Vector3::new(5.0, 0.5, 3.0), [0u8; 32], current);

        let mut corrected = KeyFrameAndPose::new();
        corrected.insert(current, Sim3::from_se3(&true_current.inverse()));
        let mut non_corrected = KeyFrameAndPose::new();
        non_corrected.insert(current, Sim3::from_se3(&map.get_keyframe(current).unwrap().pose_cw()));
        let mut connections = LoopConnections::new();
        connections.insert(current, [loop_kf].into_iter().collect());

        let lock = RwLock::new(map);
        let result = optimize_essential_graph(
            &lock,
            loop_kf,
            current,
            &non_corrected,
            &corrected,
            &connections,
            &PoseGraphConfig::default(),
        )
        .unwrap();

        assert!(result.final_error <= result.initial_error);
        assert!(result.landmarks_moved >= 1);

        let map = lock.read();
        // The fixed loop keyframe does not move.
        approx::assert_relative_eq!(
            map.get_keyframe(loop_kf).unwrap().pose.translation,
            Vector3::zeros(),
            epsilon = 1e-9
        );
        assert!(map.get_map_point(mp).is_some());
    }
}
