//! Map module - Core SLAM map data structures.
//!
//! This module contains:
//! - [`KeyFrame`] - Retained rig poses with feature observations
//! - [`MapPoint`] - 3D landmarks observed by KeyFrames
//! - [`Map`] - Arena managing KeyFrames, MapPoints, and their relationships
//! - [`ErasureLease`] - Scoped protection of a KeyFrame against culling
//!
//! # Architecture
//!
//! The map forms a bipartite graph structure:
//! - KeyFrames observe MapPoints (KF → MP via `map_point_ids`)
//! - MapPoints track their observers (MP → KF via `observations`)
//!
//! KeyFrames also maintain three graph structures:
//! - **Covisibility Graph**: Edges weighted by shared MapPoint count
//! - **Spanning Tree**: Parent/children links rooted at the origin KeyFrame
//! - **Loop Edges**: Permanent links added by loop closure
//!
//! Entries are never removed from the arena: erased KeyFrames and merged
//! MapPoints stay as tombstones (`is_bad`) so ids held elsewhere remain valid.
//!
//! # Example
//!
//! ```ignore
//! use rig_loop_closing::atlas::map::Map;
//!
//! let mut map = Map::new();
//! let kf_id = map.create_keyframe(timestamp, pose, features, bow_vector);
//! let mp_id = map.create_map_point(position, descriptor, kf_id);
//! map.associate(kf_id, feature_idx, mp_id);
//! map.update_connections(kf_id);
//! ```

pub mod erase_guard;
pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use erase_guard::{ErasureLease, LeaseLedger};
pub use keyframe::KeyFrame;
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
