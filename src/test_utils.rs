//! Deterministic fakes for the audio and service seams.
//!
//! Shared by unit tests and the integration tests under `tests/`; none of
//! them need audio hardware or network access.

use crate::audio::codec::{encode_pcm16, pcm16_to_base64};
use crate::audio::{
    AudioBackend, HandleId, MicStream, MicrophoneSource, OutputDevice, ScheduledBuffer,
};
use crate::config::{AudioConfig, ServiceConfig};
use crate::error::{FailureReason, LiveError, Result};
use crate::pipeline::messages::InboundChunk;
use crate::transport::{VoiceChannel, VoiceConnector};
use bytes::Bytes;
use futures_util::Sink;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Base64 PCM16 of a quiet tone lasting `seconds` at `sample_rate`.
pub fn pcm_base64(seconds: f64, sample_rate: u32) -> String {
    let n = (seconds * f64::from(sample_rate)).round() as usize;
    let samples: Vec<f32> = (0..n)
        .map(|i| if i % 2 == 0 { 0.1 } else { -0.1 })
        .collect();
    pcm16_to_base64(&encode_pcm16(&samples))
}

/// An inbound chunk carrying `seconds` of audio.
pub fn audio_chunk(seq: u64, seconds: f64, sample_rate: u32) -> InboundChunk {
    InboundChunk {
        seq,
        payload: Bytes::from(pcm_base64(seconds, sample_rate)),
        received_at: Instant::now(),
    }
}

/// A `serverContent` message with the given base64 audio parts and flags.
pub fn audio_message(parts: &[&str], interrupted: bool, turn_complete: bool) -> serde_json::Value {
    let parts: Vec<_> = parts
        .iter()
        .map(|data| {
            serde_json::json!({
                "inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}
            })
        })
        .collect();
    serde_json::json!({
        "serverContent": {
            "modelTurn": {"parts": parts},
            "interrupted": interrupted,
            "turnComplete": turn_complete,
        }
    })
}

// ---------------------------------------------------------------------------
// Output device with a hand-driven clock
// ---------------------------------------------------------------------------

/// One buffer as recorded by [`ManualClockOutput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledVoice {
    pub id: HandleId,
    pub start: Duration,
    pub duration: Duration,
    pub stopped: bool,
}

struct FakeVoice {
    id: HandleId,
    start: Duration,
    duration: Duration,
    stopped: Arc<AtomicBool>,
    ended: Option<mpsc::UnboundedSender<HandleId>>,
}

#[derive(Default)]
struct ClockState {
    now: Duration,
    voices: Vec<FakeVoice>,
    closed: bool,
}

/// Output device whose clock only moves when the test calls [`advance`](Self::advance).
pub struct ManualClockOutput {
    sample_rate: u32,
    state: Mutex<ClockState>,
    closes: AtomicUsize,
    faults: Mutex<Option<mpsc::UnboundedSender<FailureReason>>>,
}

impl ManualClockOutput {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            state: Mutex::new(ClockState::default()),
            closes: AtomicUsize::new(0),
            faults: Mutex::new(None),
        })
    }

    /// Simulate the device failing mid-session. Reported once.
    pub fn fail(&self, message: &str) {
        if let Some(faults) = lock(&self.faults).take() {
            let _ = faults.send(FailureReason::DeviceUnavailable(message.to_owned()));
        }
    }

    /// Move the clock forward, reporting every unstopped buffer that ends.
    pub fn advance(&self, by: Duration) {
        let mut state = lock(&self.state);
        state.now += by;
        let now = state.now;
        for voice in &mut state.voices {
            if voice.stopped.load(Ordering::Acquire) || voice.start + voice.duration > now {
                continue;
            }
            if let Some(ended) = voice.ended.take() {
                let _ = ended.send(voice.id);
            }
        }
    }

    /// Every buffer scheduled so far, in scheduling order.
    pub fn scheduled(&self) -> Vec<ScheduledVoice> {
        lock(&self.state)
            .voices
            .iter()
            .map(|v| ScheduledVoice {
                id: v.id,
                start: v.start,
                duration: v.duration,
                stopped: v.stopped.load(Ordering::Acquire),
            })
            .collect()
    }

    /// Number of times [`OutputDevice::close`] was called.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct FakeVoiceHandle(Arc<AtomicBool>);

impl ScheduledBuffer for FakeVoiceHandle {
    fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl OutputDevice for ManualClockOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> Duration {
        lock(&self.state).now
    }

    fn schedule_buffer(
        &self,
        id: HandleId,
        samples: Arc<[f32]>,
        start: Duration,
        ended: mpsc::UnboundedSender<HandleId>,
    ) -> Result<Box<dyn ScheduledBuffer>> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(LiveError::DeviceUnavailable("output device closed".into()));
        }
        let stopped = Arc::new(AtomicBool::new(false));
        state.voices.push(FakeVoice {
            id,
            start,
            duration: Duration::from_secs_f64(samples.len() as f64 / f64::from(self.sample_rate)),
            stopped: Arc::clone(&stopped),
            ended: Some(ended),
        });
        Ok(Box::new(FakeVoiceHandle(stopped)))
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        lock(&self.state).closed = true;
    }
}

// ---------------------------------------------------------------------------
// Microphone fed by the test
// ---------------------------------------------------------------------------

struct MicState {
    sample_rate: u32,
    rx: Mutex<Option<mpsc::Receiver<Vec<f32>>>>,
    open_error: Mutex<Option<LiveError>>,
    is_open: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Microphone whose blocks are pushed by the test through a channel.
#[derive(Clone)]
pub struct ScriptedMicrophone {
    state: Arc<MicState>,
}

impl ScriptedMicrophone {
    /// A working microphone and the sender that feeds it. Dropping the
    /// sender looks like the device disappearing.
    pub fn new(sample_rate: u32) -> (Self, mpsc::Sender<Vec<f32>>) {
        let (tx, rx) = mpsc::channel(64);
        let mic = Self {
            state: Arc::new(MicState {
                sample_rate,
                rx: Mutex::new(Some(rx)),
                open_error: Mutex::new(None),
                is_open: AtomicBool::new(false),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }),
        };
        (mic, tx)
    }

    /// A microphone whose first `open` fails with `err`.
    pub fn failing(err: LiveError) -> Self {
        let (mic, _tx) = Self::new(16_000);
        *lock(&mic.state.open_error) = Some(err);
        mic
    }

    /// True once the microphone was opened and has since been released.
    pub fn is_closed(&self) -> bool {
        self.state.opens.load(Ordering::SeqCst) > 0 && !self.state.is_open.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Number of times `close` was called.
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

impl MicrophoneSource for ScriptedMicrophone {
    fn open(&mut self) -> Result<MicStream> {
        if let Some(err) = lock(&self.state.open_error).take() {
            return Err(err);
        }
        let rx = lock(&self.state.rx)
            .take()
            .ok_or_else(|| LiveError::DeviceUnavailable("microphone already opened".into()))?;
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.is_open.store(true, Ordering::SeqCst);
        Ok(MicStream {
            sample_rate: self.state.sample_rate,
            rx,
        })
    }

    fn close(&mut self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.state.is_open.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Audio backend
// ---------------------------------------------------------------------------

/// Hands out one scripted microphone and one manual-clock output.
pub struct FakeAudioBackend {
    pub microphone: ScriptedMicrophone,
    pub output: Arc<ManualClockOutput>,
    output_error: Mutex<Option<LiveError>>,
}

impl FakeAudioBackend {
    pub fn new(microphone: ScriptedMicrophone, output: Arc<ManualClockOutput>) -> Self {
        Self {
            microphone,
            output,
            output_error: Mutex::new(None),
        }
    }

    /// Make the next `open_output` fail with `err`.
    pub fn with_output_error(self, err: LiveError) -> Self {
        *lock(&self.output_error) = Some(err);
        self
    }
}

impl AudioBackend for FakeAudioBackend {
    fn microphone(&self, _config: &AudioConfig) -> Result<Box<dyn MicrophoneSource>> {
        Ok(Box::new(self.microphone.clone()))
    }

    fn open_output(
        &self,
        _config: &AudioConfig,
        faults: mpsc::UnboundedSender<FailureReason>,
    ) -> Result<Arc<dyn OutputDevice>> {
        if let Some(err) = lock(&self.output_error).take() {
            return Err(err);
        }
        *lock(&self.output.faults) = Some(faults);
        Ok(Arc::clone(&self.output) as Arc<dyn OutputDevice>)
    }
}

// ---------------------------------------------------------------------------
// In-memory voice service
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum SetupReply {
    Ack,
    Reject(String),
}

struct ServiceEnds {
    client_tx: mpsc::UnboundedSender<String>,
    server_rx: mpsc::UnboundedReceiver<Result<String>>,
    replies: mpsc::WeakUnboundedSender<Result<String>>,
    closes: Arc<AtomicUsize>,
}

/// [`VoiceConnector`] backed by in-process channels.
pub struct ChannelConnector {
    refuse: Option<String>,
    setup_reply: SetupReply,
    send_delay: Option<Duration>,
    stall_after_setup: bool,
    ends: Mutex<Option<ServiceEnds>>,
}

/// The service side of a [`ChannelConnector`].
pub struct FakeService {
    client_rx: mpsc::UnboundedReceiver<String>,
    server_tx: Option<mpsc::UnboundedSender<Result<String>>>,
    closes: Arc<AtomicUsize>,
}

impl ChannelConnector {
    /// A service that acknowledges setup.
    pub fn new() -> (Self, FakeService) {
        Self::build(SetupReply::Ack, None)
    }

    /// A service that answers setup with an error.
    pub fn rejecting_setup(message: &str) -> (Self, FakeService) {
        Self::build(SetupReply::Reject(message.to_owned()), None)
    }

    /// A service whose link takes `delay` to accept each outbound message.
    pub fn with_send_delay(delay: Duration) -> (Self, FakeService) {
        Self::build(SetupReply::Ack, Some(delay))
    }

    /// A service that acknowledges setup and then never reads again.
    pub fn stalling() -> (Self, FakeService) {
        let (mut connector, service) = Self::build(SetupReply::Ack, None);
        connector.stall_after_setup = true;
        (connector, service)
    }

    /// A connector that can never connect.
    pub fn refusing(message: &str) -> Self {
        Self {
            refuse: Some(message.to_owned()),
            setup_reply: SetupReply::Ack,
            send_delay: None,
            stall_after_setup: false,
            ends: Mutex::new(None),
        }
    }

    fn build(setup_reply: SetupReply, send_delay: Option<Duration>) -> (Self, FakeService) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let connector = Self {
            refuse: None,
            setup_reply,
            send_delay,
            stall_after_setup: false,
            ends: Mutex::new(Some(ServiceEnds {
                client_tx,
                server_rx,
                replies: server_tx.downgrade(),
                closes: Arc::clone(&closes),
            })),
        };
        let service = FakeService {
            client_rx,
            server_tx: Some(server_tx),
            closes,
        };
        (connector, service)
    }
}

#[async_trait::async_trait]
impl VoiceConnector for ChannelConnector {
    async fn connect(&self, _config: &ServiceConfig) -> Result<VoiceChannel> {
        if let Some(message) = &self.refuse {
            return Err(LiveError::Transport(message.clone()));
        }
        let ends = lock(&self.ends)
            .take()
            .ok_or_else(|| LiveError::Transport("fake service already connected".into()))?;
        let sink = FakeSink {
            tx: Some(ends.client_tx),
            replies: ends.replies,
            setup_reply: self.setup_reply.clone(),
            delay: self.send_delay,
            sleep: None,
            stall_after_setup: self.stall_after_setup,
            stalled: false,
            closes: ends.closes,
        };
        Ok(VoiceChannel {
            sink: Box::pin(sink),
            stream: Box::pin(UnboundedReceiverStream::new(ends.server_rx)),
        })
    }
}

impl FakeService {
    /// Next message the client sent, parsed as JSON. `None` once the client
    /// closed its side.
    pub async fn next_client_message(&mut self) -> Option<serde_json::Value> {
        let text = self.client_rx.recv().await?;
        Some(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }

    /// Messages the client has sent that have not been read yet.
    pub fn drain_client_messages(&mut self) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(text) = self.client_rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)));
        }
        out
    }

    pub fn push_json(&self, value: serde_json::Value) {
        self.push(Ok(value.to_string()));
    }

    pub fn push_text(&self, text: &str) {
        self.push(Ok(text.to_owned()));
    }

    /// Make the connection fail with a transport error.
    pub fn push_error(&self, message: &str) {
        self.push(Err(LiveError::Transport(message.to_owned())));
    }

    /// Close the connection from the service side.
    pub fn hang_up(&mut self) {
        self.server_tx = None;
    }

    /// Number of times the client closed its sending side.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn push(&self, item: Result<String>) {
        if let Some(tx) = &self.server_tx {
            let _ = tx.send(item);
        }
    }
}

struct FakeSink {
    tx: Option<mpsc::UnboundedSender<String>>,
    replies: mpsc::WeakUnboundedSender<Result<String>>,
    setup_reply: SetupReply,
    delay: Option<Duration>,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
    stall_after_setup: bool,
    stalled: bool,
    closes: Arc<AtomicUsize>,
}

impl FakeSink {
    fn reply_to_setup(&self) {
        let Some(replies) = self.replies.upgrade() else {
            return;
        };
        let reply = match &self.setup_reply {
            SetupReply::Ack => serde_json::json!({"setupComplete": {}}),
            SetupReply::Reject(message) => serde_json::json!({"error": {"message": message}}),
        };
        let _ = replies.send(Ok(reply.to_string()));
    }
}

impl Sink<String> for FakeSink {
    type Error = LiveError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.tx.is_none() {
            return Poll::Ready(Err(LiveError::Transport("sink closed".into())));
        }
        if self.stalled {
            return Poll::Pending;
        }
        if let Some(delay) = self.delay {
            let sleep = self
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
            if sleep.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            self.sleep = None;
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: String) -> Result<()> {
        let is_setup = serde_json::from_str::<serde_json::Value>(&item)
            .ok()
            .is_some_and(|v| v.get("setup").is_some());
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| LiveError::Transport("sink closed".into()))?;
        tx.send(item)
            .map_err(|_| LiveError::Transport("service went away".into()))?;
        if is_setup {
            self.reply_to_setup();
            self.stalled = self.stall_after_setup;
        }
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.stalled {
            return Poll::Pending;
        }
        if self.tx.take().is_some() {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Poll::Ready(Ok(()))
    }
}
