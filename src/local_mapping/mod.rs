//! Coordination with the Local Mapping thread.
//!
//! Loop correction rewrites poses and landmarks of a whole neighbourhood, so
//! it must not interleave with local mapping. Before correcting, the loop
//! closer asks local mapping to pause and waits for the acknowledgement; it
//! resumes mapping when done (or when it gives up waiting).
//!
//! The mapping side of the protocol is [`LocalMappingGate::pause_point`],
//! called by the mapping thread between keyframes.

mod pause_gate;

pub use pause_gate::{IdleMapping, LocalMappingGate};

use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Pause protocol offered by the mapping thread.
pub trait MappingControl: Send + Sync {
    /// Ask the mapping thread to pause at its next pause point.
    fn request_pause(&self);

    /// Whether the mapping thread has acknowledged the pause.
    fn is_paused(&self) -> bool;

    /// Let the mapping thread continue.
    fn resume(&self);

    /// Block until the mapping thread is paused.
    ///
    /// Gives up after `timeout` or as soon as `abort` is raised; returns
    /// whether the pause was acknowledged.
    fn wait_until_paused(&self, timeout: Duration, abort: &AtomicBool) -> bool;
}
