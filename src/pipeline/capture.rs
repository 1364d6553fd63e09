//! Capture pipeline: microphone blocks in, fixed-size wire frames out.
//!
//! ```text
//! MicrophoneSource ──raw blocks──▶ FrameAssembler ──AudioFrame──▶ FrameQueue
//!                                        └──VolumeSample──▶ watch (UI meter)
//! ```

use crate::audio::codec::{LinearResampler, encode_pcm16, volume_level};
use crate::audio::{MicStream, MicrophoneSource};
use crate::config::LiveConfig;
use crate::error::{FailureReason, LiveError, Result};
use crate::pipeline::messages::{AudioFrame, VolumeSample};
use crate::pipeline::queue::{FrameQueueSender, PushOutcome};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Turns arbitrarily sized native-rate blocks into fixed wire-rate frames.
pub struct FrameAssembler {
    resampler: LinearResampler,
    pending: Vec<f32>,
    frame_samples: usize,
    wire_rate: u32,
    gain: f32,
    next_seq: u64,
}

impl FrameAssembler {
    pub fn new(native_rate: u32, wire_rate: u32, frame_samples: usize, gain: f32) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            resampler: LinearResampler::new(native_rate, wire_rate),
            pending: Vec::with_capacity(frame_samples * 2),
            frame_samples,
            wire_rate,
            gain,
            next_seq: 0,
        }
    }

    /// Feed one raw block; returns every window it completed, in order.
    pub fn push(&mut self, raw: &[f32], captured_at: Instant) -> Vec<(AudioFrame, VolumeSample)> {
        self.resampler.process(raw, &mut self.pending);

        let mut out = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let window: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            let volume = VolumeSample::new(volume_level(&window, self.gain));
            let frame = AudioFrame {
                seq: self.next_seq,
                samples: encode_pcm16(&window),
                sample_rate: self.wire_rate,
                captured_at,
            };
            self.next_seq += 1;
            out.push((frame, volume));
        }
        out
    }

    /// Number of frames emitted so far.
    pub fn frames_emitted(&self) -> u64 {
        self.next_seq
    }
}

/// Running capture; dropping it without [`stop`](Self::stop) aborts capture.
pub struct CaptureHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<u64>>,
}

impl CaptureHandle {
    /// Stop capturing. Returns once the device is released and every
    /// completed window has been queued. Yields the number of frames captured.
    pub async fn stop(mut self) -> u64 {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!("capture task ended abnormally: {e}");
                0
            }),
            None => 0,
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The capture pipeline for one session.
pub struct CapturePipeline;

impl CapturePipeline {
    /// Open the microphone and start producing frames.
    ///
    /// Frames go to `frames` without ever blocking; loudness goes to
    /// `volume`. If the device stops delivering while capture is running,
    /// a [`FailureReason::DeviceUnavailable`] is sent on `faults`.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::PermissionDenied`] or [`LiveError::DeviceUnavailable`]
    /// if the microphone cannot be opened.
    pub async fn start(
        mut source: Box<dyn MicrophoneSource>,
        config: &LiveConfig,
        frames: FrameQueueSender,
        volume: watch::Sender<VolumeSample>,
        faults: mpsc::UnboundedSender<FailureReason>,
    ) -> Result<CaptureHandle> {
        let (source, opened) = tokio::task::spawn_blocking(move || {
            let opened = source.open();
            (source, opened)
        })
        .await
        .map_err(|e| LiveError::DeviceUnavailable(format!("microphone open task failed: {e}")))?;
        let stream = opened?;

        info!(
            native_rate = stream.sample_rate,
            wire_rate = config.audio.input_sample_rate,
            frame_samples = config.audio.frame_samples,
            "capture pipeline started"
        );

        let assembler = FrameAssembler::new(
            stream.sample_rate,
            config.audio.input_sample_rate,
            config.audio.frame_samples,
            config.capture.volume_gain,
        );
        let cancel = CancellationToken::new();
        let stage = CaptureStage {
            assembler,
            frames,
            volume,
        };
        let task = tokio::spawn(run_capture_stage(
            stage,
            source,
            stream,
            faults,
            cancel.clone(),
        ));

        Ok(CaptureHandle {
            cancel,
            task: Some(task),
        })
    }
}

struct CaptureStage {
    assembler: FrameAssembler,
    frames: FrameQueueSender,
    volume: watch::Sender<VolumeSample>,
}

impl CaptureStage {
    fn handle_block(&mut self, block: &[f32]) {
        for (frame, level) in self.assembler.push(block, Instant::now()) {
            // The meter is best-effort; send_replace never waits on readers.
            self.volume.send_replace(level);
            if self.frames.push(frame) == PushOutcome::Closed {
                debug!("frame consumer gone, discarding frame");
            }
        }
    }
}

async fn run_capture_stage(
    mut stage: CaptureStage,
    mut source: Box<dyn MicrophoneSource>,
    stream: MicStream,
    faults: mpsc::UnboundedSender<FailureReason>,
    cancel: CancellationToken,
) -> u64 {
    let MicStream { mut rx, .. } = stream;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            block = rx.recv() => match block {
                Some(block) => stage.handle_block(&block),
                None => {
                    warn!("microphone stream ended unexpectedly");
                    let _ = faults.send(FailureReason::DeviceUnavailable(
                        "microphone stream ended".into(),
                    ));
                    break;
                }
            }
        }
    }

    // Release the device before draining so nothing new can arrive.
    match tokio::task::spawn_blocking(move || {
        source.close();
    })
    .await
    {
        Ok(()) => {}
        Err(e) => warn!("microphone close task failed: {e}"),
    }

    while let Ok(block) = rx.try_recv() {
        stage.handle_block(&block);
    }

    stage.volume.send_replace(VolumeSample::SILENT);
    let captured = stage.assembler.frames_emitted();
    info!(frames = captured, "capture pipeline stopped");
    captured
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::pipeline::queue::frame_queue;
    use crate::test_utils::ScriptedMicrophone;
    use std::time::Duration;

    #[test]
    fn assembler_emits_fixed_windows_in_sequence() {
        let mut asm = FrameAssembler::new(16_000, 16_000, 4, 5.0);
        let now = Instant::now();

        assert!(asm.push(&[0.1, 0.1, 0.1], now).is_empty());
        let out = asm.push(&[0.1; 7], now);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0.seq, 0);
        assert_eq!(out[1].0.seq, 1);
        assert!(out.iter().all(|(f, _)| f.samples.len() == 4));
        assert_eq!(asm.frames_emitted(), 2);
    }

    #[test]
    fn assembler_volume_is_mean_abs_times_gain() {
        let mut asm = FrameAssembler::new(16_000, 16_000, 4096, 5.0);
        let window = vec![0.02_f32; 4096];
        let out = asm.push(&window, Instant::now());
        assert_eq!(out.len(), 1);
        assert!((out[0].1.value() - 0.1).abs() < 1e-5);
    }

    #[test]
    fn assembler_volume_clamps() {
        let mut asm = FrameAssembler::new(16_000, 16_000, 8, 5.0);
        let out = asm.push(&[0.5; 8], Instant::now());
        assert_eq!(out[0].1.value(), 1.0);
    }

    #[test]
    fn assembler_resamples_to_wire_rate() {
        let mut asm = FrameAssembler::new(48_000, 16_000, 160, 5.0);
        // 30ms at 48kHz = 1440 samples -> 480 at 16kHz -> 3 frames of 160.
        let out = asm.push(&[0.0; 1440], Instant::now());
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|(f, _)| f.sample_rate == 16_000));
    }

    #[tokio::test]
    async fn pipeline_delivers_all_frames_in_order_then_stops() {
        let mut config = LiveConfig::default();
        config.audio.frame_samples = 4;
        let (mic, feeder) = ScriptedMicrophone::new(16_000);
        let (frames_tx, frames_rx) = frame_queue(64);
        let (volume_tx, volume_rx) = watch::channel(VolumeSample::SILENT);
        let (faults_tx, _faults_rx) = mpsc::unbounded_channel();

        let handle = CapturePipeline::start(Box::new(mic.clone()), &config, frames_tx, volume_tx, faults_tx)
            .await
            .unwrap();

        for _ in 0..5 {
            feeder.send(vec![0.1; 4]).await.unwrap();
        }
        // Let the stage consume everything before stopping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let captured = handle.stop().await;
        assert_eq!(captured, 5);
        assert!(mic.is_closed(), "device must be released when stop returns");

        let mut seqs = Vec::new();
        while let Some(frame) = frames_rx.pop().await {
            seqs.push(frame.seq);
        }
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert_eq!(*volume_rx.borrow(), VolumeSample::SILENT);
    }

    #[tokio::test]
    async fn permission_denied_is_reported_from_start() {
        let config = LiveConfig::default();
        let mic = ScriptedMicrophone::failing(LiveError::PermissionDenied);
        let (frames_tx, _frames_rx) = frame_queue(4);
        let (volume_tx, _volume_rx) = watch::channel(VolumeSample::SILENT);
        let (faults_tx, _faults_rx) = mpsc::unbounded_channel();

        let result =
            CapturePipeline::start(Box::new(mic), &config, frames_tx, volume_tx, faults_tx).await;
        assert!(matches!(result, Err(LiveError::PermissionDenied)));
    }

    #[tokio::test]
    async fn device_loss_is_reported_as_fault() {
        let config = LiveConfig::default();
        let (mic, feeder) = ScriptedMicrophone::new(16_000);
        let (frames_tx, _frames_rx) = frame_queue(4);
        let (volume_tx, _volume_rx) = watch::channel(VolumeSample::SILENT);
        let (faults_tx, mut faults_rx) = mpsc::unbounded_channel();

        let handle = CapturePipeline::start(Box::new(mic), &config, frames_tx, volume_tx, faults_tx)
            .await
            .unwrap();
        drop(feeder);

        let fault = tokio::time::timeout(Duration::from_secs(2), faults_rx.recv())
            .await
            .expect("fault should arrive")
            .unwrap();
        assert!(matches!(fault, FailureReason::DeviceUnavailable(_)));
        handle.stop().await;
    }
}
