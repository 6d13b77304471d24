//! Sim3 solver using Horn's method with RANSAC.
//!
//! Estimates the similarity `S12` (keyframe 2 rig frame → keyframe 1 rig
//! frame) from matched landmarks of two keyframes. Hypotheses come from
//! minimal samples of three points; support is counted by reprojection in
//! both keyframes through the rig projection, so a hypothesis must explain
//! what each camera actually observed.
//!
//! The solver is incremental: [`Sim3Solver::iterate`] runs a bounded batch
//! of iterations and keeps its state, which lets the estimator interleave
//! several candidates round-robin.

use std::sync::Arc;

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::Deserialize;

use crate::geometry::Sim3;
use crate::optimizer::sim3_refine::Sim3Correspondence;
use crate::tracking::frame::RigProjection;

/// χ² (2 DOF, 99%) inlier threshold on the squared reprojection error,
/// scaled by the octave variance.
const CHI2_2DOF_99: f64 = 9.210;

/// Configuration for Sim3 RANSAC and the surrounding verification.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Sim3SolverConfig {
    /// Probability of drawing at least one outlier-free sample.
    pub probability: f64,
    /// Minimum number of inliers for a hypothesis to be accepted.
    pub min_inliers: usize,
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Iterations run per candidate before moving to the next one.
    pub iterations_per_round: usize,
    /// Fix scale to 1.0 (rigs with metric depth).
    pub fix_scale: bool,
    /// Seed of the sampling RNG, combined with the candidate id.
    pub seed: u64,

    /// Appearance matches a candidate needs before a solver is built.
    pub min_appearance_matches: usize,
    /// χ² threshold of the nonlinear refinement.
    pub refine_chi2: f64,
    /// Inliers the refined transform must explain.
    pub min_refined_inliers: usize,
    /// Matches required after projecting the loop neighbourhood.
    pub min_total_matches: usize,
}

impl Default for Sim3SolverConfig {
    fn default() -> Self {
        Self {
            probability: 0.98,
            min_inliers: 15,
            max_iterations: 300,
            iterations_per_round: 50,
            fix_scale: false,
            seed: 0x5eed,
            min_appearance_matches: 15,
            refine_chi2: 10.0,
            min_refined_inliers: 20,
            min_total_matches: 20,
        }
    }
}

/// Hypothesis supported by enough inliers.
#[derive(Debug, Clone)]
pub struct Sim3Hypothesis {
    pub s12: Sim3,
    /// Inlier flag per correspondence, in input order.
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Result of one [`Sim3Solver::iterate`] batch.
#[derive(Debug, Clone)]
pub enum SolverStep {
    /// A hypothesis reached `min_inliers`.
    Found(Sim3Hypothesis),
    /// Batch finished without success; more iterations are available.
    Continue,
    /// The iteration budget is spent (or there were never enough points).
    Exhausted,
}

/// Incremental RANSAC over similarity transforms between two keyframes.
pub struct Sim3Solver {
    rig: Arc<dyn RigProjection>,
    correspondences: Vec<Sim3Correspondence>,
    /// Squared reprojection error bound per correspondence, in keyframe 1 and 2.
    max_error: Vec<(f64, f64)>,

    min_inliers: usize,
    fix_scale: bool,
    max_iterations: usize,
    iterations: usize,

    best_inliers: usize,
    best: Option<Sim3Hypothesis>,
    rng: StdRng,
}

impl Sim3Solver {
    pub fn new(
        rig: Arc<dyn RigProjection>,
        correspondences: Vec<Sim3Correspondence>,
        config: &Sim3SolverConfig,
        seed: u64,
    ) -> Self {
        let max_error = correspondences
            .iter()
            .map(|c| (CHI2_2DOF_99 / c.inv_sigma2_1, CHI2_2DOF_99 / c.inv_sigma2_2))
            .collect();
        let max_iterations = adaptive_iterations(
            correspondences.len(),
            config.min_inliers,
            config.probability,
            config.max_iterations,
        );

        Self {
            rig,
            correspondences,
            max_error,
            min_inliers: config.min_inliers,
            fix_scale: config.fix_scale,
            max_iterations,
            iterations: 0,
            best_inliers: 0,
            best: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn num_correspondences(&self) -> usize {
        self.correspondences.len()
    }

    pub fn correspondences(&self) -> &[Sim3Correspondence] {
        &self.correspondences
    }

    /// Iterations run so far.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Budget after adapting to the correspondence count.
    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn is_exhausted(&self) -> bool {
        self.correspondences.len() < self.min_inliers.max(3) || self.iterations >= self.max_iterations
    }

    /// Run up to `n` more iterations.
    pub fn iterate(&mut self, n: usize) -> SolverStep {
        if self.is_exhausted() {
            return SolverStep::Exhausted;
        }

        let total = self.correspondences.len();
        let mut run = 0;
        while self.iterations < self.max_iterations && run < n {
            run += 1;
            self.iterations += 1;

            let sample = sample_three_indices(&mut self.rng, total);
            let points1: Vec<Vector3<f64>> = sample.iter().map(|&i| self.correspondences[i].p1).collect();
            let points2: Vec<Vector3<f64>> = sample.iter().map(|&i| self.correspondences[i].p2).collect();

            let Some(s12) = compute_sim3_horn(&points2, &points1, self.fix_scale) else {
                continue;
            };

            let inliers = self.check_inliers(&s12);
            let num_inliers = inliers.iter().filter(|&&ok| ok).count();
            if num_inliers >= self.best_inliers {
                self.best_inliers = num_inliers;
                let hypothesis = Sim3Hypothesis {
                    s12,
                    inliers,
                    num_inliers,
                };
                if num_inliers >= self.min_inliers {
                    self.best = Some(hypothesis.clone());
                    return SolverStep::Found(hypothesis);
                }
                self.best = Some(hypothesis);
            }
        }

        if self.iterations >= self.max_iterations {
            SolverStep::Exhausted
        } else {
            SolverStep::Continue
        }
    }

    /// Best hypothesis seen so far, whether or not it reached `min_inliers`.
    pub fn best(&self) -> Option<&Sim3Hypothesis> {
        self.best.as_ref()
    }

    /// A correspondence is an inlier if it reprojects within bounds in both
    /// keyframes.
    fn check_inliers(&self, s12: &Sim3) -> Vec<bool> {
        let s21 = s12.inverse();
        self.correspondences
            .iter()
            .zip(&self.max_error)
            .map(|(c, &(max1, max2))| {
                let e1 = self
                    .rig
                    .project_unbounded(c.camera1, &s12.transform_point(&c.p2))
                    .map(|uv| (c.uv1 - uv).norm_squared());
                let e2 = self
                    .rig
                    .project_unbounded(c.camera2, &s21.transform_point(&c.p1))
                    .map(|uv| (c.uv2 - uv).norm_squared());
                matches!((e1, e2), (Some(e1), Some(e2)) if e1 < max1 && e2 < max2)
            })
            .collect()
    }
}

/// Iteration budget `min(cap, ceil(log(1−p) / log(1−ε³)))` with
/// `ε = min_inliers / n`.
fn adaptive_iterations(n: usize, min_inliers: usize, probability: f64, cap: usize) -> usize {
    if n == 0 {
        return 0;
    }
    if min_inliers >= n {
        return 1;
    }
    let epsilon = min_inliers as f64 / n as f64;
    let w_n = epsilon.powi(3);
    let log_denom = (1.0 - w_n).ln();
    if log_denom.abs() < 1e-12 {
        return 1;
    }
    let k = ((1.0 - probability).ln() / log_denom).ceil();
    if !k.is_finite() {
        return cap.max(1);
    }
    (k as usize).clamp(1, cap.max(1))
}

/// Compute Sim3 using Horn's method (closed-form solution).
///
/// Finds `S` such that `points2 ≈ S * points1`.
///
/// Algorithm:
/// 1. Compute centroids of both point sets
/// 2. Center the points
/// 3. Compute scale (if not fixed): s = sqrt(sum(||p2||²) / sum(||p1||²))
/// 4. Compute rotation via SVD of cross-covariance matrix
/// 5. Compute translation: t = c2 - s * R * c1
///
/// Reference: B.K.P. Horn, "Closed-form solution of absolute orientation using unit quaternions"
pub fn compute_sim3_horn(points1: &[Vector3<f64>], points2: &[Vector3<f64>], fix_scale: bool) -> Option<Sim3> {
    let n = points1.len();
    if n < 3 || n != points2.len() {
        return None;
    }

    let centroid1 = compute_centroid(points1);
    let centroid2 = compute_centroid(points2);

    let centered1: Vec<_> = points1.iter().map(|p| p - centroid1).collect();
    let centered2: Vec<_> = points2.iter().map(|p| p - centroid2).collect();

    let scale = if fix_scale {
        1.0
    } else {
        let sum_sq1: f64 = centered1.iter().map(|p| p.norm_squared()).sum();
        let sum_sq2: f64 = centered2.iter().map(|p| p.norm_squared()).sum();

        if sum_sq1 < 1e-10 {
            return None;
        }
        (sum_sq2 / sum_sq1).sqrt()
    };

    // Cross-covariance H = Σ p1_i · p2_iᵀ
    let mut h = Matrix3::zeros();
    for (c1, c2) in centered1.iter().zip(&centered2) {
        h += c1 * c2.transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    // R = V * U^T
    let mut rotation_mat = v_t.transpose() * u.transpose();

    // Reflection: flip the last column of V.
    if rotation_mat.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation_mat = v * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(rotation_mat));
    let translation = centroid2 - scale * (rotation * centroid1);

    Some(Sim3 {
        rotation,
        translation,
        scale,
    })
}

fn compute_centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    let sum: Vector3<f64> = points.iter().sum();
    sum / points.len() as f64
}

/// Sample three unique random indices.
fn sample_three_indices(rng: &mut impl Rng, n: usize) -> [usize; 3] {
    let mut indices = [0usize; 3];
    indices[0] = rng.gen_range(0..n);

    loop {
        indices[1] = rng.gen_range(0..n);
        if indices[1] != indices[0] {
            break;
        }
    }

    loop {
        indices[2] = rng.gen_range(0..n);
        if indices[2] != indices[0] && indices[2] != indices[1] {
            break;
        }
    }

    indices
}
