//! Message types passed between session stages.

use crate::error::FailureReason;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One fixed-size window of captured microphone audio, ready for the wire.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Monotonic sequence number assigned at capture, starting at 0.
    pub seq: u64,
    /// Mono signed 16-bit PCM at `sample_rate`.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When the last sample of this window was captured.
    pub captured_at: Instant,
}

/// A unit of synthesized audio received from the voice service.
///
/// The payload is opaque to the transport; only the playback scheduler
/// knows how to decode it.
#[derive(Debug, Clone)]
pub struct InboundChunk {
    /// Arrival order on the connection, starting at 0.
    pub seq: u64,
    pub payload: Bytes,
    pub received_at: Instant,
}

/// A decoded chunk ready to be handed to the output device.
#[derive(Debug, Clone)]
pub struct DecodedClip {
    /// Sequence number of the chunk this clip was decoded from.
    pub seq: u64,
    /// Mono f32 samples in \[-1, 1\].
    pub samples: Arc<[f32]>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl DecodedClip {
    /// Playback length of the clip.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// Non-audio events demultiplexed from the service connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The model finished its turn.
    TurnComplete,
    /// The user barged in; any queued assistant audio must be cut.
    Interrupted,
    /// The service reported an error.
    Error(String),
    /// The service closed the connection.
    ClosedByPeer,
}

/// Everything the transport delivers inbound, in arrival order.
///
/// Audio and control share one channel so an interruption can never
/// overtake audio that arrived before it.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Audio(InboundChunk),
    Control(ControlEvent),
}

/// Lifecycle state of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Devices and connection are being acquired.
    Connecting,
    /// Audio is flowing in both directions.
    Active,
    /// Assistant audio was cut by a barge-in; waiting for the next reply.
    Interrupted,
    /// Teardown in progress.
    Closing,
    /// Torn down after a normal close.
    Closed,
    /// Torn down after a fatal error.
    Failed(FailureReason),
}

impl SessionState {
    /// Whether the session has reached a state it can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Microphone loudness in \[0, 1\], for UI metering only.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct VolumeSample(f32);

impl VolumeSample {
    pub const SILENT: Self = Self(0.0);

    /// Clamp `value` into \[0, 1\]. NaN maps to silence.
    pub fn new(value: f32) -> Self {
        if value.is_nan() {
            return Self::SILENT;
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_duration_from_sample_count() {
        let clip = DecodedClip {
            seq: 0,
            samples: vec![0.0; 24_000].into(),
            sample_rate: 24_000,
        };
        assert_eq!(clip.duration(), Duration::from_secs(1));
    }

    #[test]
    fn clip_duration_zero_rate_is_zero() {
        let clip = DecodedClip {
            seq: 0,
            samples: vec![0.0; 10].into(),
            sample_rate: 0,
        };
        assert_eq!(clip.duration(), Duration::ZERO);
    }

    #[test]
    fn volume_sample_clamps() {
        assert_eq!(VolumeSample::new(1.7).value(), 1.0);
        assert_eq!(VolumeSample::new(-0.2).value(), 0.0);
        assert_eq!(VolumeSample::new(f32::NAN), VolumeSample::SILENT);
        assert!((VolumeSample::new(0.25).value() - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed(FailureReason::PermissionDenied).is_terminal());
        assert!(!SessionState::Closing.is_terminal());
        assert!(!SessionState::Interrupted.is_terminal());
    }

    #[test]
    fn failed_state_displays_reason() {
        let state = SessionState::Failed(FailureReason::Transport("timeout".into()));
        assert_eq!(state.to_string(), "failed: connection failed: timeout");
    }
}
