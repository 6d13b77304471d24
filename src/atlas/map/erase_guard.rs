//! Scoped erase protection for keyframes.
//!
//! While a keyframe is being used by an in-flight loop-closing pass it must
//! not be culled by local mapping. Protection is taken as an [`ErasureLease`]
//! and released when the lease is dropped, so every exit path of the pipeline
//! (including early rejections and panics unwinding through it) releases it
//! exactly once.
//!
//! The flag itself lives behind an `Arc` shared with the keyframe, which lets
//! a lease outlive the map read guard it was acquired under.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::types::KeyFrameId;

/// Per-keyframe protection flag.
#[derive(Debug, Clone, Default)]
pub struct EraseProtection {
    held: Arc<AtomicBool>,
}

impl EraseProtection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a lease currently holds this keyframe.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// Counts lease acquisitions and releases across a map.
///
/// After every pipeline pass the two counters must be equal; tests use this
/// to prove no exit path leaks or double-releases a lease.
#[derive(Debug, Default)]
pub struct LeaseLedger {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl LeaseLedger {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Leases currently alive.
    pub fn outstanding(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

/// RAII erase protection on one keyframe.
#[derive(Debug)]
pub struct ErasureLease {
    kf_id: KeyFrameId,
    held: Arc<AtomicBool>,
    ledger: Arc<LeaseLedger>,
}

impl ErasureLease {
    /// Take the protection flag. Fails if another pass already holds it.
    pub(crate) fn acquire(
        kf_id: KeyFrameId,
        protection: &EraseProtection,
        ledger: &Arc<LeaseLedger>,
    ) -> Option<Self> {
        protection
            .held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        ledger.acquired.fetch_add(1, Ordering::SeqCst);
        Some(Self {
            kf_id,
            held: Arc::clone(&protection.held),
            ledger: Arc::clone(ledger),
        })
    }

    pub fn keyframe_id(&self) -> KeyFrameId {
        self.kf_id
    }
}

impl Drop for ErasureLease {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
        self.ledger.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive_and_released_on_drop() {
        let protection = EraseProtection::new();
        let ledger = Arc::new(LeaseLedger::default());

        let lease = ErasureLease::acquire(KeyFrameId::new(4), &protection, &ledger).unwrap();
        assert!(protection.is_held());
        assert!(ErasureLease::acquire(KeyFrameId::new(4), &protection, &ledger).is_none());
        assert_eq!(lease.keyframe_id(), KeyFrameId::new(4));

        drop(lease);
        assert!(!protection.is_held());
        assert_eq!(ledger.acquired(), 1);
        assert_eq!(ledger.released(), 1);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_lease_released_when_moved_into_collection() {
        let protection = EraseProtection::new();
        let ledger = Arc::new(LeaseLedger::default());

        let leases: Vec<_> = ErasureLease::acquire(KeyFrameId::new(1), &protection, &ledger)
            .into_iter()
            .collect();
        assert_eq!(ledger.outstanding(), 1);
        drop(leases);
        assert_eq!(ledger.outstanding(), 0);
        assert!(ErasureLease::acquire(KeyFrameId::new(1), &protection, &ledger).is_some());
    }
}
