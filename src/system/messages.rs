//! Inter-thread message types.
//!
//! Everything the loop-closing thread reacts to arrives as a [`LoopCommand`]
//! on a single channel, so resets and shutdowns are ordered with respect to
//! keyframe insertions.

use crossbeam_channel::Sender;

use crate::atlas::map::KeyFrameId;

/// Command sent to the loop-closing thread.
#[derive(Debug)]
pub enum LoopCommand {
    /// A keyframe finished local mapping and is ready for loop detection.
    NewKeyFrame(KeyFrameId),

    /// Drop all queued keyframes and detection state. The thread replies on
    /// the enclosed sender once the reset is done.
    Reset(Sender<()>),

    /// Stop the thread after the current step.
    Finish,
}
