//! Frame-level data: rig camera model and per-keyframe features.

pub mod camera;
pub mod features;

pub use camera::{CameraRig, PinholeCamera, PinholeIntrinsics, RigProjection};
pub use features::{descriptor_distance, Descriptor, Feature, TH_HIGH, TH_LOW};
