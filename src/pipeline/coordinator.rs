//! Session controller: owns one live session and wires the stages together.
//!
//! ```text
//! mic ─▶ CapturePipeline ─▶ FrameQueue ─▶ forwarder ─▶ TransportHandle ─▶ service
//!                 │                                          │
//!                 └─▶ volume watch          TransportEvent ◀─┘
//!                                                │
//!                              event loop ───────┴──▶ PlaybackScheduler ─▶ speaker
//! ```
//!
//! Resources are acquired in `start()` and released only by the teardown
//! path, which runs exactly once per session whether it is triggered by
//! `close()`, a failed `start()`, a fatal fault or the peer hanging up.

use crate::audio::{AudioBackend, OutputDevice};
use crate::config::LiveConfig;
use crate::error::{FailureReason, LiveError, Result};
use crate::pipeline::capture::{CaptureHandle, CapturePipeline};
use crate::pipeline::messages::{ControlEvent, SessionState, TransportEvent, VolumeSample};
use crate::pipeline::queue::{FrameQueueReceiver, frame_queue};
use crate::pipeline::scheduler::{PlaybackScheduler, PlaybackStats, SchedulerHandle};
use crate::transport::{TransportHandle, VoiceConnector};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long teardown waits for queued frames to reach the transport.
const FORWARD_DRAIN_TIMEOUT: Duration = Duration::from_millis(750);

/// The device and network seams a session is built from.
#[derive(Clone)]
pub struct SessionBackends {
    pub audio: Arc<dyn AudioBackend>,
    pub connector: Arc<dyn VoiceConnector>,
}

enum Phase {
    Idle,
    Starting,
    Running(Box<Resources>),
    Closing,
    Done,
}

/// Everything a session holds while it runs. Fields are filled in
/// acquisition order so a partial start can be torn down the same way.
#[derive(Default)]
struct Resources {
    output: Option<Arc<dyn OutputDevice>>,
    scheduler: Option<PlaybackScheduler>,
    capture: Option<CaptureHandle>,
    transport: Option<Arc<TransportHandle>>,
    forwarder: Option<JoinHandle<ForwardStats>>,
    event_loop: Option<(CancellationToken, JoinHandle<()>)>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ForwardStats {
    forwarded: u64,
    dropped: u64,
}

impl Resources {
    /// Release everything: capture, then transport, then scheduler.
    async fn teardown(mut self, volume: &watch::Sender<VolumeSample>) {
        if let Some((cancel, task)) = self.event_loop.take() {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!("session event loop failed: {e}");
            }
        }

        let captured = match self.capture.take() {
            Some(capture) => capture.stop().await,
            None => 0,
        };
        let forward = match self.forwarder.take() {
            Some(mut task) => match tokio::time::timeout(FORWARD_DRAIN_TIMEOUT, &mut task).await {
                Ok(Ok(stats)) => stats,
                Ok(Err(e)) => {
                    warn!("frame forwarder failed: {e}");
                    ForwardStats::default()
                }
                Err(_) => {
                    warn!("connection not draining, abandoning queued frames");
                    task.abort();
                    ForwardStats::default()
                }
            },
            None => ForwardStats::default(),
        };

        let mut frames_sent = 0;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
            frames_sent = transport.frames_sent();
        }

        let playback = match self.scheduler.take() {
            Some(scheduler) => scheduler.reset().await,
            None => PlaybackStats::default(),
        };

        if let Some(output) = self.output.take() {
            // cpal joins its device thread on close.
            if let Err(e) = tokio::task::spawn_blocking(move || output.close()).await {
                warn!("output close task failed: {e}");
            }
        }

        volume.send_replace(VolumeSample::SILENT);
        info!(
            frames_captured = captured,
            frames_forwarded = forward.forwarded,
            frames_dropped = forward.dropped,
            frames_sent,
            clips_scheduled = playback.scheduled,
            chunks_undecodable = playback.decode_failures,
            "session resources released"
        );
    }
}

struct Shared {
    config: LiveConfig,
    backends: SessionBackends,
    state_tx: watch::Sender<SessionState>,
    volume_tx: watch::Sender<VolumeSample>,
    phase: Mutex<Phase>,
    start_cancel: CancellationToken,
}

fn rank(state: &SessionState) -> u8 {
    match state {
        SessionState::Connecting => 0,
        SessionState::Active | SessionState::Interrupted => 1,
        SessionState::Closing => 2,
        SessionState::Closed | SessionState::Failed(_) => 3,
    }
}

impl Shared {
    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Publish a state change. Never moves backwards and never leaves a
    /// terminal state; `Active` and `Interrupted` may alternate.
    fn publish(&self, next: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next || current.is_terminal() || rank(&next) < rank(current) {
                return false;
            }
            info!(from = %current, to = %next, "session state changed");
            *current = next;
            true
        });
    }

    fn finish(&self, terminal: SessionState) {
        self.publish(terminal);
        *self.lock_phase() = Phase::Done;
    }

    async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.state_tx.subscribe();
        match rx.wait_for(SessionState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state_tx.borrow().clone(),
        }
    }

    /// Acquire devices and the connection, in order, storing each as it
    /// succeeds. Returns what the event loop needs.
    async fn acquire(
        &self,
        res: &mut Resources,
        faults: &mpsc::UnboundedSender<FailureReason>,
    ) -> Result<(SchedulerHandle, mpsc::UnboundedReceiver<TransportEvent>)> {
        let audio = Arc::clone(&self.backends.audio);
        let audio_config = self.config.audio.clone();
        let output_faults = faults.clone();
        let output =
            tokio::task::spawn_blocking(move || audio.open_output(&audio_config, output_faults))
                .await
                .map_err(|e| {
                    LiveError::DeviceUnavailable(format!("output open task failed: {e}"))
                })??;
        res.output = Some(Arc::clone(&output));

        let scheduler = PlaybackScheduler::spawn(output);
        let scheduler_handle = scheduler.handle();
        res.scheduler = Some(scheduler);

        let microphone = self.backends.audio.microphone(&self.config.audio)?;
        let (frames_tx, frames_rx) = frame_queue(self.config.capture.queue_capacity);
        res.capture = Some(
            CapturePipeline::start(
                microphone,
                &self.config,
                frames_tx,
                self.volume_tx.clone(),
                faults.clone(),
            )
            .await?,
        );

        let (transport, events) = TransportHandle::open(
            self.backends.connector.as_ref(),
            &self.config.service,
            faults.clone(),
        )
        .await?;
        let transport = Arc::new(transport);
        res.transport = Some(Arc::clone(&transport));

        res.forwarder = Some(tokio::spawn(forward_frames(frames_rx, transport)));
        Ok((scheduler_handle, events))
    }

    /// Tear down a running session after a fault or a peer close.
    /// Does nothing if the session is not running (close() got there first).
    async fn shutdown(self: Arc<Self>, terminal: SessionState) {
        let res = {
            let mut phase = self.lock_phase();
            match std::mem::replace(&mut *phase, Phase::Closing) {
                Phase::Running(res) => res,
                other => {
                    *phase = other;
                    return;
                }
            }
        };
        self.publish(SessionState::Closing);
        res.teardown(&self.volume_tx).await;
        self.finish(terminal);
    }
}

/// Move frames from the capture queue to the transport, in capture order.
/// Ends once capture has stopped and the queue is drained.
async fn forward_frames(frames: FrameQueueReceiver, transport: Arc<TransportHandle>) -> ForwardStats {
    let mut forwarded = 0;
    while let Some(frame) = frames.pop().await {
        if let Err(e) = transport.send(frame).await {
            debug!("frame forwarder stopping: {e}");
            break;
        }
        forwarded += 1;
    }
    ForwardStats {
        forwarded,
        dropped: frames.dropped(),
    }
}

async fn run_event_loop(
    shared: Arc<Shared>,
    scheduler: SchedulerHandle,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut faults: mpsc::UnboundedReceiver<FailureReason>,
    cancel: CancellationToken,
) {
    let terminal = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            Some(reason) = faults.recv() => break SessionState::Failed(reason),
            event = events.recv() => match event {
                Some(TransportEvent::Audio(chunk)) => {
                    shared.state_tx.send_if_modified(|state| {
                        if *state == SessionState::Interrupted {
                            info!("assistant audio resumed");
                            *state = SessionState::Active;
                            true
                        } else {
                            false
                        }
                    });
                    if scheduler.enqueue(chunk).is_err() {
                        return;
                    }
                }
                Some(TransportEvent::Control(ControlEvent::Interrupted)) => {
                    match scheduler.interrupt().await {
                        Ok(report) => debug!(stopped = report.stopped, "barge-in handled"),
                        Err(_) => return,
                    }
                    shared.publish(SessionState::Interrupted);
                }
                Some(TransportEvent::Control(ControlEvent::TurnComplete)) => {
                    debug!("assistant turn complete");
                }
                Some(TransportEvent::Control(ControlEvent::Error(message))) => {
                    warn!("voice service error: {message}");
                    break SessionState::Failed(FailureReason::Service(message));
                }
                Some(TransportEvent::Control(ControlEvent::ClosedByPeer)) | None => {
                    break SessionState::Closed;
                }
            }
        }
    };
    // The teardown joins this task, so it has to run elsewhere.
    tokio::spawn(shared.shutdown(terminal));
}

/// One live voice session.
///
/// Cloning yields another handle to the same session, so `close()` can be
/// called from a signal handler while another task awaits `start()`.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    /// Create an idle session.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Config`] if `config` fails validation.
    pub fn new(config: LiveConfig, backends: SessionBackends) -> Result<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        let (volume_tx, _) = watch::channel(VolumeSample::SILENT);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                backends,
                state_tx,
                volume_tx,
                phase: Mutex::new(Phase::Idle),
                start_cancel: CancellationToken::new(),
            }),
        })
    }

    /// Acquire the output device, microphone and service connection, then
    /// start streaming. A session can be started once.
    ///
    /// On failure everything acquired so far is released and the state
    /// ends in `Failed(reason)`.
    ///
    /// # Errors
    ///
    /// - [`LiveError::AlreadyStarted`] / [`LiveError::SessionClosed`] if the
    ///   session is not idle.
    /// - [`LiveError::SessionClosed`] if `close()` interrupted the start.
    /// - Any device or transport error that prevented the session opening.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        {
            let mut phase = shared.lock_phase();
            match *phase {
                Phase::Idle => *phase = Phase::Starting,
                Phase::Starting | Phase::Running(_) => return Err(LiveError::AlreadyStarted),
                Phase::Closing | Phase::Done => return Err(LiveError::SessionClosed),
            }
            shared.publish(SessionState::Connecting);
        }

        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let mut res = Resources::default();
        let acquired = tokio::select! {
            biased;
            () = shared.start_cancel.cancelled() => None,
            result = shared.acquire(&mut res, &faults_tx) => Some(result),
        };
        drop(faults_tx);

        match acquired {
            Some(Ok((scheduler, events))) => {
                // The guard must not live across the teardown await below.
                let leftover = {
                    let mut phase = shared.lock_phase();
                    if matches!(*phase, Phase::Starting) {
                        let cancel = CancellationToken::new();
                        let task = tokio::spawn(run_event_loop(
                            Arc::clone(shared),
                            scheduler,
                            events,
                            faults_rx,
                            cancel.clone(),
                        ));
                        res.event_loop = Some((cancel, task));
                        shared.publish(SessionState::Active);
                        *phase = Phase::Running(Box::new(res));
                        None
                    } else {
                        Some(res)
                    }
                };
                let Some(res) = leftover else {
                    return Ok(());
                };
                debug!("session closed while starting");
                res.teardown(&shared.volume_tx).await;
                shared.finish(SessionState::Closed);
                Err(LiveError::SessionClosed)
            }
            None => {
                debug!("session start cancelled");
                res.teardown(&shared.volume_tx).await;
                shared.finish(SessionState::Closed);
                Err(LiveError::SessionClosed)
            }
            Some(Err(e)) => {
                warn!("session failed to start: {e}");
                shared.publish(SessionState::Closing);
                res.teardown(&shared.volume_tx).await;
                shared.finish(SessionState::Failed(FailureReason::from(&e)));
                Err(e)
            }
        }
    }

    /// Tear the session down and return its terminal state.
    ///
    /// Safe to call at any time and any number of times: only the first
    /// call runs the teardown, later calls wait for it and return the same
    /// state.
    pub async fn close(&self) -> SessionState {
        let shared = &self.shared;
        let running = {
            let mut phase = shared.lock_phase();
            match std::mem::replace(&mut *phase, Phase::Closing) {
                Phase::Idle => {
                    *phase = Phase::Done;
                    shared.publish(SessionState::Closing);
                    shared.publish(SessionState::Closed);
                    None
                }
                Phase::Starting => {
                    shared.publish(SessionState::Closing);
                    shared.start_cancel.cancel();
                    None
                }
                Phase::Running(res) => {
                    shared.publish(SessionState::Closing);
                    Some(res)
                }
                Phase::Closing => None,
                Phase::Done => {
                    *phase = Phase::Done;
                    None
                }
            }
        };

        if let Some(res) = running {
            info!("closing live session");
            res.teardown(&shared.volume_tx).await;
            shared.finish(SessionState::Closed);
        }
        shared.wait_terminal().await
    }

    /// Subscribe to session state changes.
    pub fn status(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to microphone loudness for metering.
    pub fn volume(&self) -> watch::Receiver<VolumeSample> {
        self.shared.volume_tx.subscribe()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.state_tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_utils::{
        ChannelConnector, FakeAudioBackend, FakeService, ManualClockOutput, ScriptedMicrophone,
    };
    use std::time::Duration;

    struct Rig {
        session: SessionController,
        service: FakeService,
        output: Arc<ManualClockOutput>,
        mic: ScriptedMicrophone,
        feeder: mpsc::Sender<Vec<f32>>,
    }

    fn rig() -> Rig {
        let (mic, feeder) = ScriptedMicrophone::new(16_000);
        let output = ManualClockOutput::new(24_000);
        let (connector, service) = ChannelConnector::new();
        let backends = SessionBackends {
            audio: Arc::new(FakeAudioBackend::new(mic.clone(), Arc::clone(&output))),
            connector: Arc::new(connector),
        };
        let session = SessionController::new(LiveConfig::default(), backends).unwrap();
        Rig {
            session,
            service,
            output,
            mic,
            feeder,
        }
    }

    async fn wait_state(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
            .await
            .expect("state should be reached")
            .unwrap();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (mic, _feeder) = ScriptedMicrophone::new(16_000);
        let (connector, _service) = ChannelConnector::new();
        let backends = SessionBackends {
            audio: Arc::new(FakeAudioBackend::new(mic, ManualClockOutput::new(24_000))),
            connector: Arc::new(connector),
        };
        let mut config = LiveConfig::default();
        config.capture.queue_capacity = 0;
        assert!(matches!(
            SessionController::new(config, backends),
            Err(LiveError::Config(_))
        ));
    }

    #[tokio::test]
    async fn start_reaches_active_and_close_releases_everything() {
        let rig = rig();
        rig.session.start().await.unwrap();
        assert_eq!(rig.session.state(), SessionState::Active);

        assert_eq!(rig.session.close().await, SessionState::Closed);
        assert!(rig.mic.is_closed());
        assert_eq!(rig.output.close_count(), 1);
        assert_eq!(rig.service.close_count(), 1);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let rig = rig();
        rig.session.start().await.unwrap();
        assert!(matches!(rig.session.start().await, Err(LiveError::AlreadyStarted)));
        rig.session.close().await;
        assert!(matches!(rig.session.start().await, Err(LiveError::SessionClosed)));
    }

    #[tokio::test]
    async fn close_before_start_goes_straight_to_closed() {
        let rig = rig();
        assert_eq!(rig.session.close().await, SessionState::Closed);
        assert_eq!(rig.mic.open_count(), 0);
        assert_eq!(rig.output.close_count(), 0);
    }

    #[tokio::test]
    async fn output_failure_fails_start_and_releases_nothing_twice() {
        let (mic, _feeder) = ScriptedMicrophone::new(16_000);
        let output = ManualClockOutput::new(24_000);
        let (connector, _service) = ChannelConnector::new();
        let backends = SessionBackends {
            audio: Arc::new(
                FakeAudioBackend::new(mic.clone(), Arc::clone(&output))
                    .with_output_error(LiveError::DeviceUnavailable("no speaker".into())),
            ),
            connector: Arc::new(connector),
        };
        let session = SessionController::new(LiveConfig::default(), backends).unwrap();

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, LiveError::DeviceUnavailable(_)));
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureReason::DeviceUnavailable("no speaker".into()))
        );
        assert_eq!(mic.open_count(), 0);
        assert_eq!(session.close().await, session.state());
    }

    #[tokio::test]
    async fn interruption_cycles_back_to_active_on_next_audio() {
        let rig = rig();
        let mut status = rig.session.status();
        rig.session.start().await.unwrap();

        rig.service.push_json(crate::test_utils::audio_message(
            &[&crate::test_utils::pcm_base64(1.0, 24_000)],
            false,
            false,
        ));
        rig.service
            .push_json(serde_json::json!({"serverContent": {"interrupted": true}}));
        wait_state(&mut status, SessionState::Interrupted).await;
        assert!(rig.output.scheduled().iter().all(|v| v.stopped));

        rig.service.push_json(crate::test_utils::audio_message(
            &[&crate::test_utils::pcm_base64(0.5, 24_000)],
            false,
            false,
        ));
        wait_state(&mut status, SessionState::Active).await;
        rig.session.close().await;
    }

    #[tokio::test]
    async fn service_error_fails_the_session() {
        let rig = rig();
        let mut status = rig.session.status();
        rig.session.start().await.unwrap();

        rig.service
            .push_json(serde_json::json!({"error": {"message": "quota exceeded"}}));
        wait_state(
            &mut status,
            SessionState::Failed(FailureReason::Service("quota exceeded".into())),
        )
        .await;
        assert!(rig.mic.is_closed());
        assert_eq!(rig.output.close_count(), 1);
        assert_eq!(
            rig.session.close().await,
            SessionState::Failed(FailureReason::Service("quota exceeded".into()))
        );
        assert_eq!(rig.output.close_count(), 1);
    }

    #[tokio::test]
    async fn peer_hang_up_closes_normally() {
        let mut rig = rig();
        let mut status = rig.session.status();
        rig.session.start().await.unwrap();

        rig.service.hang_up();
        wait_state(&mut status, SessionState::Closed).await;
        assert!(rig.mic.is_closed());
        assert_eq!(rig.session.close().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn microphone_loss_fails_the_session() {
        let rig = rig();
        let mut status = rig.session.status();
        rig.session.start().await.unwrap();

        drop(rig.feeder);
        let state = tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(SessionState::is_terminal),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert!(matches!(
            state,
            SessionState::Failed(FailureReason::DeviceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn start_runs_on_a_spawned_task() {
        let rig = rig();
        let session = rig.session.clone();
        tokio::spawn(async move { session.start().await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rig.session.state(), SessionState::Active);
        assert_eq!(rig.session.close().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn output_device_loss_fails_the_session() {
        let rig = rig();
        let mut status = rig.session.status();
        rig.session.start().await.unwrap();

        rig.output.fail("speaker unplugged");
        wait_state(
            &mut status,
            SessionState::Failed(FailureReason::DeviceUnavailable("speaker unplugged".into())),
        )
        .await;
        assert!(rig.mic.is_closed());
        assert_eq!(rig.output.close_count(), 1);
        assert_eq!(rig.service.close_count(), 1);
    }

    #[tokio::test]
    async fn volume_is_published_and_reset_on_close() {
        let rig = rig();
        let mut volume = rig.session.volume();
        rig.session.start().await.unwrap();

        rig.feeder.send(vec![0.02; 4096]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), volume.wait_for(|v| v.value() > 0.0))
            .await
            .unwrap()
            .unwrap();
        assert!((volume.borrow().value() - 0.1).abs() < 1e-3);

        rig.session.close().await;
        assert_eq!(*volume.borrow(), VolumeSample::SILENT);
    }
}
