//! LoopCloser - the loop closing thread.
//!
//! The worker owns the keyframe queue and every stage of the pipeline:
//! 1. Drains pending commands (keyframes, reset, finish)
//! 2. Pops one keyframe and runs detection
//! 3. Verifies consistent candidates with Sim3
//! 4. Corrects the map for an accepted loop
//!
//! Other threads talk to it only through [`LoopClosingHandle`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::atlas::keyframe_db::KeyFrameDatabase;
use crate::atlas::map::KeyFrameId;
use crate::config::LoopClosingConfig;
use crate::matcher::{DescriptorMatcher, RigMatcher};
use crate::optimizer::{GraphOptimizer, LmOptimizer};
use crate::system::{LoopCommand, SharedState};
use crate::tracking::frame::RigProjection;

use super::corrector::{CorrectionOutcome, LoopCorrector};
use super::detector::LoopDetector;
use super::estimator::Sim3Estimator;

/// Configuration of the worker loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// How long the idle worker blocks on the command channel.
    pub idle_interval_ms: u64,
    /// How long a reset requester waits for the acknowledgement.
    pub reset_timeout_ms: u64,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: 5,
            reset_timeout_ms: 5000,
        }
    }
}

/// Statistics for the loop closer.
#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    /// Keyframes taken off the queue and run through detection.
    pub keyframes_processed: usize,

    /// Keyframes dropped from the queue by a reset.
    pub keyframes_discarded: usize,

    /// Detection cycles that produced consistent candidates.
    pub detections: usize,

    pub loops_verified: usize,
    pub loops_corrected: usize,

    /// Verified loops dropped because mapping did not pause.
    pub corrections_aborted: usize,

    /// `(current, matched)` of the last corrected loop.
    pub last_loop: Option<(KeyFrameId, KeyFrameId)>,
}

/// Statistics shared between the worker and its handle.
#[derive(Debug, Default)]
struct StatsBoard {
    stats: Mutex<LoopCloserStats>,
    changed: Condvar,
}

impl StatsBoard {
    fn update(&self, f: impl FnOnce(&mut LoopCloserStats)) {
        f(&mut self.stats.lock());
        self.changed.notify_all();
    }
}

/// The loop closing worker.
pub struct LoopCloser {
    shared: Arc<SharedState>,
    detector: LoopDetector,
    estimator: Sim3Estimator,
    corrector: LoopCorrector,
    queue: VecDeque<KeyFrameId>,
    commands: Receiver<LoopCommand>,
    config: ThreadConfig,
    stats: Arc<StatsBoard>,
}

impl LoopCloser {
    /// Build the pipeline with the default components for `rig`.
    pub fn new(
        shared: Arc<SharedState>,
        rig: Arc<dyn RigProjection>,
        config: &LoopClosingConfig,
        commands: Receiver<LoopCommand>,
    ) -> Self {
        let matcher: Arc<dyn DescriptorMatcher> = Arc::new(RigMatcher::new(Arc::clone(&rig), config.matcher.clone()));
        let optimizer: Arc<dyn GraphOptimizer> = Arc::new(LmOptimizer::new(
            Arc::clone(&rig),
            config.refine.clone(),
            config.pose_graph.clone(),
        ));

        let detector = LoopDetector::new(Box::new(KeyFrameDatabase::new()), config.detector.clone());
        let estimator = Sim3Estimator::new(
            rig,
            Arc::clone(&matcher),
            Arc::clone(&optimizer),
            config.sim3.clone(),
            config.matcher.similarity_radius,
            config.matcher.projection_radius,
        );
        let corrector = LoopCorrector::new(matcher, optimizer, config.corrector.clone(), config.matcher.fuse_radius);

        Self::with_components(shared, detector, estimator, corrector, config.thread.clone(), commands)
    }

    pub fn with_components(
        shared: Arc<SharedState>,
        detector: LoopDetector,
        estimator: Sim3Estimator,
        corrector: LoopCorrector,
        config: ThreadConfig,
        commands: Receiver<LoopCommand>,
    ) -> Self {
        Self {
            shared,
            detector,
            estimator,
            corrector,
            queue: VecDeque::new(),
            commands,
            config,
            stats: Arc::new(StatsBoard::default()),
        }
    }

    pub fn detector(&self) -> &LoopDetector {
        &self.detector
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> LoopCloserStats {
        self.stats.stats.lock().clone()
    }

    /// Run until finished, shut down or disconnected.
    pub fn run(mut self) {
        info!("[LoopCloser] thread started");
        let idle = Duration::from_millis(self.config.idle_interval_ms);

        loop {
            if !self.drain_commands() || self.shared.is_shutdown_requested() {
                break;
            }
            if self.process_next() {
                continue;
            }
            match self.commands.recv_timeout(idle) {
                Ok(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("[LoopCloser] command channel disconnected");
                    break;
                }
            }
        }

        let stats = self.stats();
        info!(
            "[LoopCloser] thread exiting: processed={}, detected={}, verified={}, corrected={}, {} keyframes left in queue",
            stats.keyframes_processed,
            stats.detections,
            stats.loops_verified,
            stats.loops_corrected,
            self.queue.len()
        );
    }

    /// Apply every pending command. Returns `false` once the worker should
    /// stop.
    pub fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    if !self.handle_command(command) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_command(&mut self, command: LoopCommand) -> bool {
        match command {
            LoopCommand::NewKeyFrame(kf_id) if kf_id.0 == 0 => {
                debug!("[LoopCloser] ignoring origin keyframe {}", kf_id);
                true
            }
            LoopCommand::NewKeyFrame(kf_id) => {
                self.queue.push_back(kf_id);
                true
            }
            LoopCommand::Reset(reply) => {
                let discarded = self.queue.len();
                self.queue.clear();
                self.detector.reset();
                self.stats.update(|s| s.keyframes_discarded += discarded);
                info!("[LoopCloser] reset, {} queued keyframes discarded", discarded);
                // The requester may have given up waiting.
                let _ = reply.send(());
                true
            }
            LoopCommand::Finish => false,
        }
    }

    /// Run the pipeline on the oldest queued keyframe. Returns `false` if
    /// the queue was empty.
    ///
    /// Every pass ends by erasing the keyframes whose erasure was deferred
    /// while this pass held them, whatever the pass concluded.
    pub fn process_next(&mut self) -> bool {
        let Some(kf_id) = self.queue.pop_front() else {
            return false;
        };

        self.run_pass(kf_id);

        let erased = self.shared.map.write().flush_pending_erasures();
        if erased > 0 {
            debug!("[LoopCloser] {}: {} deferred keyframe erasures applied", kf_id, erased);
        }
        self.stats.update(|s| s.keyframes_processed += 1);
        true
    }

    /// Detection, verification and correction for one keyframe. Every lease
    /// taken here is released before it returns.
    fn run_pass(&mut self, kf_id: KeyFrameId) {
        let detection = {
            let map = self.shared.map.read();
            self.detector.detect(&map, kf_id)
        };
        let detection = match detection {
            Ok(d) => d,
            Err(reason) => {
                debug!("[LoopCloser] {}: no loop ({:?})", kf_id, reason);
                return;
            }
        };
        self.stats.update(|s| s.detections += 1);

        let Some(loop_match) = self.estimator.compute(&self.shared.map, detection) else {
            return;
        };
        self.stats.update(|s| s.loops_verified += 1);

        match self.corrector.correct(&self.shared, loop_match) {
            CorrectionOutcome::Corrected(report) => {
                self.detector.set_last_loop(report.current_kf);
                self.stats.update(|s| {
                    s.loops_corrected += 1;
                    s.last_loop = Some((report.current_kf, report.matched_kf));
                });
            }
            CorrectionOutcome::Aborted => {
                self.stats.update(|s| s.corrections_aborted += 1);
            }
        }
    }
}

/// Owner-side handle of a spawned loop closer.
pub struct LoopClosingHandle {
    commands: Sender<LoopCommand>,
    shared: Arc<SharedState>,
    stats: Arc<StatsBoard>,
    submitted: AtomicUsize,
    reset_timeout: Duration,
    worker: Option<thread::JoinHandle<()>>,
}

impl LoopClosingHandle {
    /// Queue a keyframe for loop detection.
    ///
    /// The map origin (id 0) is never queued; returns whether the keyframe
    /// was accepted.
    pub fn insert_keyframe(&self, kf_id: KeyFrameId) -> Result<bool> {
        if kf_id.0 == 0 {
            debug!("[LoopClosingHandle] ignoring origin keyframe {}", kf_id);
            return Ok(false);
        }
        self.commands
            .send(LoopCommand::NewKeyFrame(kf_id))
            .context("Loop closing thread has exited")?;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    /// Discard queued keyframes and the detection state; blocks until the
    /// worker acknowledges.
    pub fn request_reset(&self) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(LoopCommand::Reset(reply_tx))
            .context("Loop closing thread has exited")?;
        reply_rx
            .recv_timeout(self.reset_timeout)
            .with_context(|| format!("Loop closer did not acknowledge reset within {:?}", self.reset_timeout))
    }

    /// Block until every submitted keyframe was processed or discarded.
    pub fn wait_until_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut stats = self.stats.stats.lock();
        loop {
            let settled = stats.keyframes_processed + stats.keyframes_discarded;
            if settled >= self.submitted.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.is_finished() {
                bail!("Loop closing thread exited with {} keyframes unprocessed", self.submitted.load(Ordering::SeqCst) - settled);
            }
            if self.stats.changed.wait_until(&mut stats, deadline).timed_out() {
                bail!("Loop closer still busy after {:?}", timeout);
            }
        }
    }

    pub fn stats(&self) -> LoopCloserStats {
        self.stats.stats.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    /// Stop the worker and wait for it. Queued keyframes are dropped.
    pub fn join(mut self) -> Result<LoopCloserStats> {
        self.finish()?;
        Ok(self.stats())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.shared.request_shutdown();
        // A disconnected channel means the worker is already on its way out.
        let _ = self.commands.send(LoopCommand::Finish);
        worker.join().map_err(|_| anyhow!("Loop closing thread panicked"))
    }
}

impl Drop for LoopClosingHandle {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("[LoopClosingHandle] {}", e);
        }
    }
}

/// Spawn the loop closing thread with the default pipeline for `rig`.
pub fn spawn(shared: Arc<SharedState>, rig: Arc<dyn RigProjection>, config: &LoopClosingConfig) -> Result<LoopClosingHandle> {
    let (commands, receiver) = crossbeam_channel::unbounded();
    let closer = LoopCloser::new(Arc::clone(&shared), rig, config, receiver);
    spawn_worker(closer, commands, config.thread.reset_timeout_ms)
}

/// Spawn an already assembled worker; `commands` must feed its receiver.
pub fn spawn_worker(closer: LoopCloser, commands: Sender<LoopCommand>, reset_timeout_ms: u64) -> Result<LoopClosingHandle> {
    let shared = Arc::clone(&closer.shared);
    let stats = Arc::clone(&closer.stats);
    let worker = thread::Builder::new()
        .name("loop_closing".into())
        .spawn(move || closer.run())
        .context("Failed to spawn loop closing thread")?;

    Ok(LoopClosingHandle {
        commands,
        shared,
        stats,
        submitted: AtomicUsize::new(0),
        reset_timeout: Duration::from_millis(reset_timeout_ms),
        worker: Some(worker),
    })
}
