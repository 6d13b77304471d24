//! State shared between the loop closer and its collaborators, and the
//! commands accepted by the loop-closing thread.

pub mod messages;
pub mod shared_state;

pub use messages::LoopCommand;
pub use shared_state::SharedState;
