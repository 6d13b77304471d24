//! Tracking-side contracts used by loop closing.
//!
//! Per-frame tracking lives outside this crate. Loop correction moves the
//! tracker's reference keyframes discontinuously, so the tracker must drop
//! its motion model and relocalize; this is signalled through
//! [`TrackingControl`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub mod frame;

/// Signals a loop-closing component may send to the tracker.
pub trait TrackingControl: Send + Sync {
    /// Force the tracker into relocalization on its next frame.
    fn force_relocalization(&self);
}

/// Edge-triggered relocalization request.
///
/// The loop closer raises it; the tracker consumes it with
/// [`RelocalizationSignal::take`], which clears the flag so every request is
/// observed exactly once.
#[derive(Debug, Default)]
pub struct RelocalizationSignal {
    requested: AtomicBool,
    raised: AtomicUsize,
}

impl RelocalizationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a pending request.
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    pub fn is_pending(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Number of requests raised since creation.
    pub fn times_raised(&self) -> usize {
        self.raised.load(Ordering::SeqCst)
    }
}

impl TrackingControl for RelocalizationSignal {
    fn force_relocalization(&self) {
        self.raised.fetch_add(1, Ordering::SeqCst);
        self.requested.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relocalization_is_one_shot() {
        let signal = RelocalizationSignal::new();
        assert!(!signal.take());

        signal.force_relocalization();
        assert!(signal.is_pending());
        assert!(signal.take());
        assert!(!signal.take());
        assert_eq!(signal.times_raised(), 1);
    }
}
