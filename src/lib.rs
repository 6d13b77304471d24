pub mod atlas;
pub mod config;
pub mod geometry;
pub mod local_mapping;
pub mod loop_closing;
pub mod matcher;
pub mod optimizer;
pub mod simulation;
pub mod system;
pub mod tracking;
