//! Mutex + condvar implementation of the mapping pause protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::MappingControl;

/// Slice of a bounded wait after which abort flags are re-checked.
const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct GateState {
    pause_requested: bool,
    paused: bool,
}

/// Pause gate shared by the loop closer and the mapping thread.
#[derive(Debug, Default)]
pub struct LocalMappingGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl LocalMappingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pause_requested(&self) -> bool {
        self.state.lock().pause_requested
    }

    /// Mapping-thread side: if a pause was requested, acknowledge it and
    /// block until resumed or `shutdown` is raised.
    ///
    /// Returns whether the thread paused.
    pub fn pause_point(&self, shutdown: &AtomicBool) -> bool {
        let mut state = self.state.lock();
        if !state.pause_requested {
            return false;
        }
        state.paused = true;
        self.changed.notify_all();
        debug!("[LocalMapping] paused");

        while state.pause_requested && !shutdown.load(Ordering::SeqCst) {
            self.changed.wait_for(&mut state, WAIT_SLICE);
        }

        state.paused = false;
        self.changed.notify_all();
        debug!("[LocalMapping] resumed");
        true
    }
}

impl MappingControl for LocalMappingGate {
    fn request_pause(&self) {
        let mut state = self.state.lock();
        state.pause_requested = true;
        self.changed.notify_all();
    }

    fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        state.pause_requested = false;
        self.changed.notify_all();
    }

    fn wait_until_paused(&self, timeout: Duration, abort: &AtomicBool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.paused {
                return true;
            }
            if abort.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.changed.wait_for(&mut state, (deadline - now).min(WAIT_SLICE));
        }
    }
}

/// Mapping control for runs without a local-mapping thread (offline
/// processing and tests): every pause is acknowledged immediately.
#[derive(Debug, Default)]
pub struct IdleMapping {
    paused: AtomicBool,
}

impl IdleMapping {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MappingControl for IdleMapping {
    fn request_pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn wait_until_paused(&self, _timeout: Duration, abort: &AtomicBool) -> bool {
        self.is_paused() && !abort.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pause_handshake_with_mapping_thread() {
        let gate = Arc::new(LocalMappingGate::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mapper = {
            let gate = Arc::clone(&gate);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                let mut pauses = 0;
                while !shutdown.load(Ordering::SeqCst) {
                    if gate.pause_point(&shutdown) {
                        pauses += 1;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                pauses
            })
        };

        let abort = AtomicBool::new(false);
        gate.request_pause();
        assert!(gate.wait_until_paused(Duration::from_secs(5), &abort));
        assert!(gate.is_paused());

        gate.resume();
        shutdown.store(true, Ordering::SeqCst);
        assert_eq!(mapper.join().unwrap(), 1);
        assert!(!gate.is_paused());
    }

    #[test]
    fn test_wait_times_out_without_mapping_thread() {
        let gate = LocalMappingGate::new();
        let abort = AtomicBool::new(false);
        gate.request_pause();

        let start = Instant::now();
        assert!(!gate.wait_until_paused(Duration::from_millis(30), &abort));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_aborts_early() {
        let gate = LocalMappingGate::new();
        let abort = AtomicBool::new(true);
        gate.request_pause();

        let start = Instant::now();
        assert!(!gate.wait_until_paused(Duration::from_secs(10), &abort));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_idle_mapping_acknowledges_immediately() {
        let idle = IdleMapping::new();
        let abort = AtomicBool::new(false);
        idle.request_pause();
        assert!(idle.wait_until_paused(Duration::ZERO, &abort));
        idle.resume();
        assert!(!idle.is_paused());
    }
}
