//! Descriptor matching between keyframes and landmark sets.
//!
//! Loop closing needs four kinds of correspondence search:
//! - appearance matching between two keyframes (no geometry)
//! - guided matching between two keyframes under a similarity hypothesis
//! - projection of a landmark set into a keyframe under a similarity pose
//! - fusion of a landmark set into a keyframe (attach or merge)
//!
//! All of them work on feature slots: `matches[i]` is the landmark matched
//! to slot `i` of the query keyframe.

pub mod rig_matcher;

pub use rig_matcher::RigMatcher;

use serde::Deserialize;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::Sim3;
use crate::tracking::frame::{TH_HIGH, TH_LOW};

/// Landmark pair produced by fusion: `(duplicate, survivor)`.
pub type Replacement = (MapPointId, MapPointId);

/// Correspondence search used by the loop-closing pipeline.
///
/// Within one call a landmark is never matched to more than one slot.
pub trait DescriptorMatcher: Send + Sync {
    /// Match landmarks of `kf1` against landmarks of `kf2` by descriptor only.
    ///
    /// `matches` is resized to the slot count of `kf1`; returns the number of
    /// matches found.
    fn search_by_appearance(
        &self,
        map: &Map,
        kf1: KeyFrameId,
        kf2: KeyFrameId,
        matches: &mut Vec<Option<MapPointId>>,
    ) -> usize;

    /// Find additional matches between `kf1` and `kf2` given `s12` (maps
    /// `kf2` rig coordinates into `kf1` rig coordinates). Existing matches
    /// are kept; returns the number of new matches.
    fn search_by_similarity(
        &self,
        map: &Map,
        kf1: KeyFrameId,
        kf2: KeyFrameId,
        matches: &mut [Option<MapPointId>],
        s12: &Sim3,
        radius: f64,
    ) -> usize;

    /// Project `points` into `kf` with the similarity pose `scw` and fill
    /// empty slots of `matches`. Returns the number of new matches.
    fn search_by_projection(
        &self,
        map: &Map,
        kf: KeyFrameId,
        scw: &Sim3,
        points: &[MapPointId],
        matches: &mut [Option<MapPointId>],
        radius: f64,
    ) -> usize;

    /// Project `points` into `kf` with `scw`. Empty matched slots get the
    /// landmark attached; occupied ones are reported in `replacements` as
    /// `(existing, projected)` for the caller to merge. Returns the number of
    /// fused landmarks.
    fn fuse(
        &self,
        map: &mut Map,
        kf: KeyFrameId,
        scw: &Sim3,
        points: &[MapPointId],
        radius: f64,
        replacements: &mut Vec<Replacement>,
    ) -> usize;
}

/// Thresholds for [`RigMatcher`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Best/second-best ratio for appearance matching.
    pub appearance_ratio: f64,
    /// Descriptor distance accepted for guided and projection matches.
    pub th_low: u32,
    /// Descriptor distance accepted for similarity-guided matches.
    pub th_high: u32,
    /// Search radius (pixels at level 0) for `search_by_similarity`.
    pub similarity_radius: f64,
    /// Search radius for `search_by_projection`.
    pub projection_radius: f64,
    /// Search radius for `fuse`.
    pub fuse_radius: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            appearance_ratio: 0.9,
            th_low: TH_LOW,
            th_high: TH_HIGH,
            similarity_radius: 10.0,
            projection_radius: 10.0,
            fuse_radius: 4.0,
        }
    }
}
