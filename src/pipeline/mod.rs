//! The live session pipeline: capture, hand-off, playback scheduling and
//! the controller that owns them.

pub mod capture;
pub mod coordinator;
pub mod messages;
pub mod queue;
pub mod scheduler;
