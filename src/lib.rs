//! Marta Live: real-time, full-duplex voice sessions with a hosted voice model.
//!
//! Microphone audio is streamed to the service while synthesized replies
//! are played back gaplessly, and cut off immediately when the user talks
//! over them.
//!
//! # Architecture
//!
//! One [`SessionController`] owns four pieces for the lifetime of a session:
//! - **Capture pipeline**: microphone blocks become fixed-size PCM16 frames
//!   plus a loudness meter
//! - **Frame queue**: non-blocking, drop-oldest hand-off from capture to the network
//! - **Transport**: the duplex service connection, demultiplexing inbound
//!   messages into audio chunks and control events
//! - **Playback scheduler**: an actor that sequences decoded clips on the
//!   output device clock and stops everything on barge-in
//!
//! Devices and the service connection sit behind traits ([`audio::AudioBackend`],
//! [`transport::VoiceConnector`]) so the whole session can run against the
//! fakes in `test_utils` (enabled by the `test-utils` feature).

pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use config::LiveConfig;
pub use error::{FailureReason, LiveError, Result};
pub use pipeline::coordinator::{SessionBackends, SessionController};
pub use pipeline::messages::{SessionState, VolumeSample};
