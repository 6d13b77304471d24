//! Atlas module - Map storage and place recognition.
//!
//! - [`map`] - KeyFrames, MapPoints and the graphs linking them
//! - [`keyframe_db`] - Inverted-index KeyFrame database used to find loop
//!   candidates by appearance

pub mod keyframe_db;
pub mod map;

// Re-export commonly used types
pub use keyframe_db::{BowVector, KeyFrameDatabase, PlaceRecognition};
pub use map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
