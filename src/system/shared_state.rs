//! Shared state between the loop closer, local mapping and tracking.
//!
//! The `SharedState` struct holds all data that needs to be accessed by
//! multiple threads, protected by appropriate synchronization primitives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::atlas::map::Map;
use crate::local_mapping::MappingControl;
use crate::tracking::TrackingControl;

/// Shared state accessible by every SLAM thread.
pub struct SharedState {
    /// The map with all keyframes and landmarks.
    /// Protected by RwLock: detection reads, correction writes.
    pub map: RwLock<Map>,

    /// Pause protocol of the local-mapping thread.
    pub mapping: Arc<dyn MappingControl>,

    /// Signals to the tracker.
    pub tracking: Arc<dyn TrackingControl>,

    /// Request the loop closer to finish and exit.
    shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new(
        map: Map,
        mapping: Arc<dyn MappingControl>,
        tracking: Arc<dyn TrackingControl>,
    ) -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(map),
            mapping,
            tracking,
            shutdown_requested: AtomicBool::new(false),
        })
    }

    /// Request shutdown. Blocking waits of the loop closer observe it.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// The raw shutdown flag, for waits that poll an abort flag.
    pub fn shutdown_flag(&self) -> &AtomicBool {
        &self.shutdown_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_mapping::IdleMapping;
    use crate::tracking::RelocalizationSignal;

    #[test]
    fn test_shutdown_flag() {
        let shared = SharedState::new(
            Map::new(),
            Arc::new(IdleMapping::new()),
            Arc::new(RelocalizationSignal::new()),
        );
        assert!(!shared.is_shutdown_requested());
        shared.request_shutdown();
        assert!(shared.is_shutdown_requested());
        assert!(shared.shutdown_flag().load(Ordering::SeqCst));
    }
}
