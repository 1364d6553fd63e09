//! Error types for the live voice session.

use std::fmt;

/// Top-level error type for the live session core.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// Microphone access was refused by the OS or the user.
    #[error("microphone permission denied")]
    PermissionDenied,

    /// An audio device could not be opened or disappeared mid-session.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Connection-level failure talking to the voice service.
    #[error("transport error: {0}")]
    Transport(String),

    /// A single inbound audio chunk could not be decoded.
    #[error("chunk decode error: {0}")]
    ChunkDecode(String),

    /// The service sent something that violates the session protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// The session has already been closed and cannot be (re)started.
    #[error("session closed")]
    SessionClosed,

    /// `start()` was called on a session that is already running.
    #[error("session already started")]
    AlreadyStarted,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, LiveError>;

/// Why a session ended in [`SessionState::Failed`](crate::pipeline::messages::SessionState).
///
/// Unlike [`LiveError`] this is `Clone + Eq` so it can be published through
/// a `watch` channel and compared in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    PermissionDenied,
    DeviceUnavailable(String),
    Transport(String),
    /// Error reported by the voice service itself.
    Service(String),
    /// Anything else that forced the session down.
    Internal(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "microphone permission denied"),
            Self::DeviceUnavailable(msg) => write!(f, "audio device unavailable: {msg}"),
            Self::Transport(msg) => write!(f, "connection failed: {msg}"),
            Self::Service(msg) => write!(f, "service error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl From<&LiveError> for FailureReason {
    fn from(err: &LiveError) -> Self {
        match err {
            LiveError::PermissionDenied => Self::PermissionDenied,
            LiveError::DeviceUnavailable(msg) => Self::DeviceUnavailable(msg.clone()),
            LiveError::Transport(msg) => Self::Transport(msg.clone()),
            LiveError::Protocol(msg) => Self::Service(msg.clone()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<LiveError> for FailureReason {
    fn from(err: LiveError) -> Self {
        Self::from(&err)
    }
}
