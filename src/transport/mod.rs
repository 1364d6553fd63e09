//! Session transport: the duplex connection to the voice service.
//!
//! ```text
//!  send(frame) ──▶ [cap 1] ──▶ writer task ──▶ VoiceChannel sink
//!  VoiceChannel stream ──▶ reader task ──▶ TransportEvent channel (ordered)
//! ```
//!
//! A [`VoiceConnector`] produces a raw text channel; this module owns the
//! setup handshake, frame encoding, inbound demultiplexing and the
//! `Connecting -> Open -> Closing -> Closed` state machine.

pub mod protocol;
pub mod websocket;

use crate::config::ServiceConfig;
use crate::error::{FailureReason, LiveError, Result};
use crate::pipeline::messages::{AudioFrame, ControlEvent, InboundChunk, TransportEvent};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use protocol::{ClientMessage, ServerEvent, ServerMessage};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use websocket::WebSocketConnector;

/// How long `close()` lets the writer flush before dropping the connection.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound half of a raw service connection.
pub type MessageSink = Pin<Box<dyn Sink<String, Error = LiveError> + Send>>;
/// Inbound half of a raw service connection.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An established, not yet initialised, connection carrying JSON text.
pub struct VoiceChannel {
    pub sink: MessageSink,
    pub stream: MessageStream,
}

/// Opens raw connections to the voice service.
#[async_trait::async_trait]
pub trait VoiceConnector: Send + Sync {
    /// Connect to the service described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Transport`] if the connection cannot be made.
    async fn connect(&self, config: &ServiceConfig) -> Result<VoiceChannel>;
}

/// Connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed(String),
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

/// An open session connection.
///
/// Inbound events arrive on the receiver returned by [`open`](Self::open).
pub struct TransportHandle {
    frames_tx: mpsc::Sender<AudioFrame>,
    state_rx: watch::Receiver<TransportState>,
    state_tx: Arc<watch::Sender<TransportState>>,
    cancel: CancellationToken,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    frames_sent: Arc<AtomicU64>,
}

impl TransportHandle {
    /// Connect, perform the setup handshake and start the I/O tasks.
    ///
    /// Connection-level failures after this returns are reported once on
    /// `faults`.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Transport`] if the connection cannot be made or
    /// drops during setup, [`LiveError::Protocol`] if the service rejects
    /// the setup.
    pub async fn open(
        connector: &dyn VoiceConnector,
        config: &ServiceConfig,
        faults: mpsc::UnboundedSender<FailureReason>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (state_tx, state_rx) = watch::channel(TransportState::Connecting);
        info!(model = %config.model, "connecting to voice service");

        let VoiceChannel {
            mut sink,
            mut stream,
        } = connector.connect(config).await?;
        handshake(&mut sink, &mut stream, config).await?;

        state_tx.send_replace(TransportState::Open);
        info!("voice service session open");

        let state_tx = Arc::new(state_tx);
        let cancel = CancellationToken::new();
        let frames_sent = Arc::new(AtomicU64::new(0));
        // Capacity 1: send() waits for the writer instead of piling frames up.
        let (frames_tx, frames_rx) = mpsc::channel::<AudioFrame>(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_writer(
            sink,
            frames_rx,
            Link {
                state: Arc::clone(&state_tx),
                faults: faults.clone(),
                cancel: cancel.clone(),
            },
            Arc::clone(&frames_sent),
        ));
        let reader = tokio::spawn(run_reader(
            stream,
            events_tx,
            Link {
                state: Arc::clone(&state_tx),
                faults,
                cancel: cancel.clone(),
            },
        ));

        Ok((
            Self {
                frames_tx,
                state_rx,
                state_tx,
                cancel,
                tasks: Mutex::new(Some((writer, reader))),
                frames_sent,
            },
            events_rx,
        ))
    }

    /// Send one captured frame. Frames reach the wire in call order.
    ///
    /// Suspends while the previous frame is still being written.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Transport`] if the connection failed, or
    /// [`LiveError::SessionClosed`] after [`close`](Self::close).
    pub async fn send(&self, frame: AudioFrame) -> Result<()> {
        if self.frames_tx.send(frame).await.is_ok() {
            return Ok(());
        }
        match self.state() {
            TransportState::Failed(msg) => Err(LiveError::Transport(msg)),
            _ => Err(LiveError::SessionClosed),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state_rx.borrow().clone()
    }

    /// Frames written to the connection so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Flush the pending frame, close the connection and wait for both I/O
    /// tasks. Calling it again, or after the peer closed, does nothing.
    pub async fn close(&self) {
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some((writer, reader)) = tasks else {
            return;
        };

        self.state_tx.send_if_modified(|state| {
            if matches!(state, TransportState::Open | TransportState::Connecting) {
                *state = TransportState::Closing;
                true
            } else {
                false
            }
        });
        self.cancel.cancel();

        let mut writer = writer;
        match tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("transport writer task failed: {e}"),
            Err(_) => {
                warn!("service stopped accepting data, dropping the connection");
                writer.abort();
                let _ = writer.await;
            }
        }
        if let Err(e) = reader.await {
            warn!("transport reader task failed: {e}");
        }

        self.state_tx.send_if_modified(|state| {
            if matches!(state, TransportState::Failed(_) | TransportState::Closed) {
                false
            } else {
                *state = TransportState::Closed;
                true
            }
        });
        info!(frames_sent = self.frames_sent(), "voice service connection closed");
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Send the setup message and wait for the service to acknowledge it.
async fn handshake(
    sink: &mut MessageSink,
    stream: &mut MessageStream,
    config: &ServiceConfig,
) -> Result<()> {
    let setup = serde_json::to_string(&ClientMessage::setup(config))
        .map_err(|e| LiveError::Protocol(format!("cannot encode setup: {e}")))?;
    sink.send(setup).await?;

    loop {
        let text = match stream.next().await {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(e),
            None => {
                return Err(LiveError::Transport(
                    "connection closed during setup".into(),
                ));
            }
        };
        let msg: ServerMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("ignoring unparseable message during setup: {e}");
                continue;
            }
        };
        for event in msg.into_events() {
            match event {
                ServerEvent::SetupComplete => {
                    debug!("setup acknowledged");
                    return Ok(());
                }
                ServerEvent::Control(ControlEvent::Error(message)) => {
                    return Err(LiveError::Protocol(format!("setup rejected: {message}")));
                }
                other => debug!(?other, "ignoring message before setup completed"),
            }
        }
    }
}

/// State and fault reporting shared by the two I/O tasks.
struct Link {
    state: Arc<watch::Sender<TransportState>>,
    faults: mpsc::UnboundedSender<FailureReason>,
    cancel: CancellationToken,
}

impl Link {
    /// Report a connection failure unless we are already shutting down.
    fn fail(&self, message: String) {
        if self.cancel.is_cancelled() {
            debug!("transport error during shutdown: {message}");
            return;
        }
        let first = self.state.send_if_modified(|state| {
            if matches!(state, TransportState::Open) {
                *state = TransportState::Failed(message.clone());
                true
            } else {
                false
            }
        });
        if first {
            warn!("voice service connection failed: {message}");
            let _ = self.faults.send(FailureReason::Transport(message));
        }
    }
}

async fn run_writer(
    mut sink: MessageSink,
    mut frames: mpsc::Receiver<AudioFrame>,
    link: Link,
    frames_sent: Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            biased;
            () = link.cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut sink, &frame).await {
                        link.fail(failure_message(e));
                        return;
                    }
                    frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    // Whatever was accepted by send() still goes out, in order.
    frames.close();
    while let Ok(frame) = frames.try_recv() {
        if let Err(e) = write_frame(&mut sink, &frame).await {
            debug!("dropping frame {} during close: {e}", frame.seq);
            break;
        }
        frames_sent.fetch_add(1, Ordering::Relaxed);
    }
    if let Err(e) = sink.close().await {
        debug!("error closing connection: {e}");
    }
}

fn failure_message(err: LiveError) -> String {
    match err {
        LiveError::Transport(msg) => msg,
        other => other.to_string(),
    }
}

async fn write_frame(sink: &mut MessageSink, frame: &AudioFrame) -> Result<()> {
    let json = serde_json::to_string(&ClientMessage::audio(frame))
        .map_err(|e| LiveError::Protocol(format!("cannot encode frame: {e}")))?;
    sink.send(json).await
}

async fn run_reader(
    mut stream: MessageStream,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Link,
) {
    let mut next_seq: u64 = 0;
    loop {
        tokio::select! {
            biased;
            () = link.cancel.cancelled() => break,
            item = stream.next() => match item {
                Some(Ok(text)) => dispatch(&text, &events, &mut next_seq),
                Some(Err(e)) => {
                    link.fail(failure_message(e));
                    break;
                }
                None => {
                    info!("voice service closed the connection");
                    link.state.send_if_modified(|state| {
                        if matches!(state, TransportState::Open) {
                            *state = TransportState::Closed;
                            true
                        } else {
                            false
                        }
                    });
                    let _ = events.send(TransportEvent::Control(ControlEvent::ClosedByPeer));
                    // Nothing more can be written to a closed connection.
                    link.cancel.cancel();
                    break;
                }
            }
        }
    }
}

fn dispatch(text: &str, events: &mpsc::UnboundedSender<TransportEvent>, next_seq: &mut u64) {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("skipping unparseable service message: {e}");
            return;
        }
    };
    for event in msg.into_events() {
        let event = match event {
            ServerEvent::Audio(payload) => {
                let seq = *next_seq;
                *next_seq += 1;
                TransportEvent::Audio(InboundChunk {
                    seq,
                    payload,
                    received_at: Instant::now(),
                })
            }
            ServerEvent::Control(control) => {
                debug!(?control, "control event");
                TransportEvent::Control(control)
            }
            ServerEvent::SetupComplete => {
                debug!("duplicate setupComplete ignored");
                continue;
            }
            ServerEvent::GoAway => {
                warn!("voice service will disconnect soon");
                continue;
            }
        };
        if events.send(event).is_err() {
            debug!("event consumer gone");
            return;
        }
    }
}
