//! Sim3 refinement between two keyframes.
//!
//! Refines the similarity `S12` (keyframe 2 rig frame → keyframe 1 rig frame)
//! by minimizing the symmetric reprojection error of matched landmarks:
//!
//! ```text
//! E = Σ_i ρ(‖u1_i − π1(S12·p2_i)‖²_Σ1) + ρ(‖u2_i − π2(S12⁻¹·p1_i)‖²_Σ2)
//! ```
//!
//! where `p1_i`/`p2_i` are the matched landmarks expressed in each keyframe's
//! rig frame, `π` projects through the camera that observed the feature and
//! `ρ` is a Huber kernel. Outliers are removed after a first pass and the
//! problem is solved again without them.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, Owned, Vector2, Vector3};
use serde::Deserialize;
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::Sim3;
use crate::tracking::frame::RigProjection;

/// Residual assigned to a point that falls behind its camera.
const BEHIND_CAMERA_RESIDUAL: f64 = 1e3;

/// Configuration for Sim3 refinement.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Sim3RefineConfig {
    /// LM patience of the first pass.
    pub initial_iterations: usize,
    /// LM patience of the second pass when outliers were removed.
    pub iterations_after_outliers: usize,
    /// LM patience of the second pass otherwise.
    pub iterations_without_outliers: usize,
    /// Refinement fails if fewer correspondences survive the first pass.
    pub min_correspondences: usize,
}

impl Default for Sim3RefineConfig {
    fn default() -> Self {
        Self {
            initial_iterations: 5,
            iterations_after_outliers: 10,
            iterations_without_outliers: 5,
            min_correspondences: 10,
        }
    }
}

/// Outcome of a successful refinement.
#[derive(Debug, Clone)]
pub struct Sim3Refinement {
    /// Refined S12.
    pub s12: Sim3,
    /// Correspondences surviving both passes.
    pub inliers: usize,
}

/// One matched landmark pair as seen from both keyframes.
#[derive(Debug, Clone)]
pub struct Sim3Correspondence {
    /// Slot of the match in keyframe 1.
    pub slot1: usize,

    pub camera1: usize,
    pub uv1: Vector2<f64>,
    pub inv_sigma2_1: f64,
    /// Keyframe 1 landmark in keyframe 1 rig frame.
    pub p1: Vector3<f64>,

    pub camera2: usize,
    pub uv2: Vector2<f64>,
    pub inv_sigma2_2: f64,
    /// Keyframe 2 landmark in keyframe 2 rig frame.
    pub p2: Vector3<f64>,
}

/// Build correspondences for every matched slot of `kf1`.
pub fn collect_correspondences(
    map: &Map,
    kf1_id: KeyFrameId,
    kf2_id: KeyFrameId,
    matches: &[Option<MapPointId>],
) -> Vec<Sim3Correspondence> {
    let (Some(kf1), Some(kf2)) = (map.good_keyframe(kf1_id), map.good_keyframe(kf2_id)) else {
        return Vec::new();
    };
    let t1w = kf1.pose_cw();
    let t2w = kf2.pose_cw();

    matches
        .iter()
        .enumerate()
        .filter_map(|(slot1, m)| {
            let mp2 = map.good_map_point(map.resolve_map_point((*m)?))?;
            let mp1 = map.good_map_point(kf1.get_map_point(slot1)?)?;
            let slot2 = *mp2.observations.get(&kf2_id)?;
            let f1 = kf1.feature(slot1)?;
            let f2 = kf2.feature(slot2)?;
            Some(Sim3Correspondence {
                slot1,
                camera1: f1.camera,
                uv1: f1.keypoint,
                inv_sigma2_1: 1.0 / map.level_sigma2(f1.octave),
                p1: t1w.transform_point(&mp1.position),
                camera2: f2.camera,
                uv2: f2.keypoint,
                inv_sigma2_2: 1.0 / map.level_sigma2(f2.octave),
                p2: t2w.transform_point(&mp2.position),
            })
        })
        .collect()
}

/// Unweighted chi² of both reprojections of a correspondence under `s12`.
fn chi2_pair(rig: &dyn RigProjection, c: &Sim3Correspondence, s12: &Sim3, s21: &Sim3) -> (f64, f64) {
    let e1 = rig
        .project_unbounded(c.camera1, &s12.transform_point(&c.p2))
        .map_or(f64::INFINITY, |uv| (c.uv1 - uv).norm_squared() * c.inv_sigma2_1);
    let e2 = rig
        .project_unbounded(c.camera2, &s21.transform_point(&c.p1))
        .map_or(f64::INFINITY, |uv| (c.uv2 - uv).norm_squared() * c.inv_sigma2_2);
    (e1, e2)
}

// ─────────────────────────────────────────────────────────────────────────────
// Least-squares problem
// ─────────────────────────────────────────────────────────────────────────────

/// S12 parameterized as a left perturbation `exp(δ)·S0` of the initial guess.
struct Sim3Problem<'a> {
    rig: &'a dyn RigProjection,
    correspondences: &'a [Sim3Correspondence],
    active: &'a [bool],
    base: Sim3,
    delta: DVector<f64>,
    huber_delta: f64,
}

impl<'a> Sim3Problem<'a> {
    fn new(
        rig: &'a dyn RigProjection,
        correspondences: &'a [Sim3Correspondence],
        active: &'a [bool],
        base: Sim3,
        fix_scale: bool,
        huber_delta: f64,
    ) -> Self {
        let dim = if fix_scale { 6 } else { 7 };
        Self {
            rig,
            correspondences,
            active,
            base,
            delta: DVector::zeros(dim),
            huber_delta,
        }
    }

    fn sim3_at(&self, delta: &DVector<f64>) -> Sim3 {
        let mut tangent = [0.0; 7];
        for (i, v) in delta.iter().enumerate() {
            tangent[i] = *v;
        }
        Sim3::exp(&tangent).compose(&self.base)
    }

    fn estimate(&self) -> Sim3 {
        self.sim3_at(&self.delta)
    }

    /// Huber-weighted residual of one reprojection.
    fn robust_residual(&self, observed: &Vector2<f64>, projected: Option<Vector2<f64>>, inv_sigma2: f64) -> Vector2<f64> {
        let Some(uv) = projected else {
            return Vector2::repeat(BEHIND_CAMERA_RESIDUAL);
        };
        let r = (observed - uv) * inv_sigma2.sqrt();
        let e = r.norm();
        if e <= self.huber_delta || e == 0.0 {
            r
        } else {
            // Scaled so that ‖r‖² equals the Huber cost 2δe − δ².
            let cost = 2.0 * self.huber_delta * e - self.huber_delta * self.huber_delta;
            r * (cost.sqrt() / e)
        }
    }

    fn residuals_at(&self, delta: &DVector<f64>) -> DVector<f64> {
        let s12 = self.sim3_at(delta);
        let s21 = s12.inverse();
        let mut res = DVector::zeros(self.correspondences.len() * 4);
        for (i, c) in self.correspondences.iter().enumerate() {
            if !self.active[i] {
                continue;
            }
            let r1 = self.robust_residual(
                &c.uv1,
                self.rig.project_unbounded(c.camera1, &s12.transform_point(&c.p2)),
                c.inv_sigma2_1,
            );
            let r2 = self.robust_residual(
                &c.uv2,
                self.rig.project_unbounded(c.camera2, &s21.transform_point(&c.p1)),
                c.inv_sigma2_2,
            );
            res[4 * i] = r1.x;
            res[4 * i + 1] = r1.y;
            res[4 * i + 2] = r2.x;
            res[4 * i + 3] = r2.y;
        }
        res
    }
}

impl<'a> LeastSquaresProblem<f64, Dyn, Dyn> for Sim3Problem<'a> {
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.delta.copy_from(params);
    }

    fn params(&self) -> DVector<f64> {
        self.delta.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(&self.delta))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        // Central differences; the problem has at most 7 parameters.
        let eps = 1e-6;
        let n_res = self.correspondences.len() * 4;
        let mut jac = DMatrix::zeros(n_res, self.delta.len());
        for p in 0..self.delta.len() {
            let mut plus = self.delta.clone();
            let mut minus = self.delta.clone();
            plus[p] += eps;
            minus[p] -= eps;
            let diff = (self.residuals_at(&plus) - self.residuals_at(&minus)) / (2.0 * eps);
            jac.set_column(p, &diff);
        }
        Some(jac)
    }
}

fn run_lm(problem: Sim3Problem<'_>, patience: usize) -> Sim3 {
    let (problem, report) = LevenbergMarquardt::new()
        .with_patience(patience)
        .minimize(problem);
    debug!(
        "[Sim3Refine] LM: {:?} after {} evaluations, cost {:.4}",
        report.termination, report.number_of_evaluations, report.objective_function
    );
    problem.estimate()
}

// ─────────────────────────────────────────────────────────────────────────────
// Refinement
// ─────────────────────────────────────────────────────────────────────────────

/// Refine `initial` over `correspondences`.
///
/// Returns the refined S12 and per-correspondence inlier flags, or `None`
/// if too few correspondences survive the first pass. `th2` is the chi²
/// threshold for a single reprojection.
pub fn refine_sim3(
    rig: &dyn RigProjection,
    correspondences: &[Sim3Correspondence],
    initial: &Sim3,
    th2: f64,
    fix_scale: bool,
    config: &Sim3RefineConfig,
) -> Option<(Sim3, Vec<bool>)> {
    if correspondences.is_empty() {
        return None;
    }
    let huber_delta = th2.sqrt();
    let mut active = vec![true; correspondences.len()];

    // First pass with the robust kernel over everything.
    let problem = Sim3Problem::new(rig, correspondences, &active, initial.clone(), fix_scale, huber_delta);
    let s12 = run_lm(problem, config.initial_iterations);

    let s21 = s12.inverse();
    let mut num_bad = 0;
    for (i, c) in correspondences.iter().enumerate() {
        let (e1, e2) = chi2_pair(rig, c, &s12, &s21);
        if e1 > th2 || e2 > th2 {
            active[i] = false;
            num_bad += 1;
        }
    }

    if correspondences.len() - num_bad < config.min_correspondences {
        debug!(
            "[Sim3Refine] {} of {} correspondences left after outlier removal",
            correspondences.len() - num_bad,
            correspondences.len()
        );
        return None;
    }

    let patience = if num_bad > 0 {
        config.iterations_after_outliers
    } else {
        config.iterations_without_outliers
    };
    let problem = Sim3Problem::new(rig, correspondences, &active, s12, fix_scale, huber_delta);
    let s12 = run_lm(problem, patience);

    let s21 = s12.inverse();
    for (i, c) in correspondences.iter().enumerate() {
        if !active[i] {
            continue;
        }
        let (e1, e2) = chi2_pair(rig, c, &s12, &s21);
        if e1 > th2 || e2 > th2 {
            active[i] = false;
        }
    }

    Some((s12, active))
}
