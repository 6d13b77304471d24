//! Loop closing for a multi-camera rig.
//!
//! Recognizes when the rig revisits a place, estimates the similarity that
//! relates the two visits and removes the accumulated drift.
//!
//! # Architecture
//!
//! The pipeline consists of:
//! 1. **Detection** (`detector.rs`): place-recognition candidates filtered by
//!    temporal consistency of their covisibility groups
//! 2. **Verification** (`estimator.rs`, `sim3_solver.rs`): appearance
//!    matching, Sim3 RANSAC, guided matching and nonlinear refinement
//! 3. **Correction** (`corrector.rs`): pose propagation through the
//!    neighbourhood, landmark fusion and essential graph optimization
//! 4. **Thread** (`loop_closer.rs`): the worker and its command channel
//!
//! # Threading Model
//!
//! One worker thread owns the queue and all detection state. The map is
//! shared through `SharedState`:
//! - Detection and verification take read locks (a short write lock tags
//!   loop landmarks)
//! - Correction pauses local mapping, then rewrites the window under the
//!   write lock
//! - The pose graph optimizer collects under a read lock, solves without a
//!   lock and applies under the write lock

pub mod corrector;
pub mod detector;
pub mod estimator;
pub mod loop_closer;
pub mod sim3_solver;

pub use corrector::{CorrectionOutcome, CorrectionReport, CorrectorConfig, LoopCorrector};
pub use detector::{Detection, LoopDetector, LoopDetectorConfig, NoLoop};
pub use estimator::{LoopMatch, Sim3Estimator};
pub use loop_closer::{spawn, LoopCloser, LoopCloserStats, LoopClosingHandle, ThreadConfig};
pub use sim3_solver::{compute_sim3_horn, Sim3Solver, Sim3SolverConfig};
