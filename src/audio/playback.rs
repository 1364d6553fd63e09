//! Audio playback to system speakers via cpal.
//!
//! [`CpalOutput`] keeps one output stream open for the whole session and
//! mixes scheduled buffers into it. Its clock is the number of frames the
//! device has actually rendered, so scheduling is sample-accurate relative
//! to what the listener hears.

use crate::audio::{
    DeviceWorker, HandleId, OutputDevice, ScheduledBuffer, classify_device_error,
};
use crate::config::AudioConfig;
use crate::error::{FailureReason, LiveError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Audio playback to system speakers via cpal.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    sample_rate: u32,
    worker: Mutex<Option<DeviceWorker>>,
}

impl CpalOutput {
    /// Open the output device and start a silent stream. A stream error
    /// later on is reported on `faults`.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available or the stream cannot start.
    pub fn open(
        config: &AudioConfig,
        faults: mpsc::UnboundedSender<FailureReason>,
    ) -> Result<Self> {
        let sample_rate = config.output_sample_rate;
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let device_name = config.output_device.clone();
        let stream_mixer = Arc::clone(&mixer);

        let (worker, ()) = DeviceWorker::spawn(
            "marta-speaker",
            move |fault_tx| {
                build_output_stream(device_name.as_deref(), sample_rate, stream_mixer, fault_tx)
            },
            move |msg| {
                let _ = faults.send(FailureReason::DeviceUnavailable(format!(
                    "output stream failed: {msg}"
                )));
            },
        )?;

        Ok(Self {
            mixer,
            sample_rate,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }

    fn lock_mixer(&self) -> MutexGuard<'_, Mixer> {
        self.mixer.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> Duration {
        let frames = self.lock_mixer().frames_rendered;
        frames_to_duration(frames, self.sample_rate)
    }

    fn schedule_buffer(
        &self,
        id: HandleId,
        samples: Arc<[f32]>,
        start: Duration,
        ended: mpsc::UnboundedSender<HandleId>,
    ) -> Result<Box<dyn ScheduledBuffer>> {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut mixer = self.lock_mixer();
        if mixer.closed {
            return Err(LiveError::DeviceUnavailable("output device closed".into()));
        }
        mixer.voices.push(Voice {
            id,
            samples,
            start_frame: duration_to_frames(start, self.sample_rate),
            stopped: Arc::clone(&stopped),
            ended,
        });
        Ok(Box::new(CpalVoiceHandle { stopped }))
    }

    fn close(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut worker) = worker {
            worker.stop();
            let mut mixer = self.lock_mixer();
            mixer.closed = true;
            mixer.voices.clear();
            info!("audio playback stopped");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Stop flag shared with the mixer for one scheduled buffer.
struct CpalVoiceHandle {
    stopped: Arc<AtomicBool>,
}

impl ScheduledBuffer for CpalVoiceHandle {
    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

struct Voice {
    id: HandleId,
    samples: Arc<[f32]>,
    start_frame: u64,
    stopped: Arc<AtomicBool>,
    ended: mpsc::UnboundedSender<HandleId>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixing state shared between the output callback and the scheduler side.
#[derive(Default)]
struct Mixer {
    frames_rendered: u64,
    voices: Vec<Voice>,
    closed: bool,
}

impl Mixer {
    /// Render the next `out.len()` frames of mono audio.
    fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let base = self.frames_rendered;
        let len = out.len() as u64;

        self.voices
            .retain(|voice| !voice.stopped.load(Ordering::Acquire));

        for voice in &self.voices {
            let from = voice.start_frame.max(base);
            let to = voice.end_frame().min(base + len);
            if from >= to {
                continue;
            }
            for frame in from..to {
                let sample = voice.samples[(frame - voice.start_frame) as usize];
                out[(frame - base) as usize] += sample;
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.frames_rendered = base + len;
        let now = self.frames_rendered;
        self.voices.retain(|voice| {
            if voice.end_frame() <= now {
                let _ = voice.ended.send(voice.id);
                false
            } else {
                true
            }
        });
    }
}

fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frames as f64 / f64::from(sample_rate))
}

fn duration_to_frames(d: Duration, sample_rate: u32) -> u64 {
    (d.as_secs_f64() * f64::from(sample_rate)).round() as u64
}

/// Build and start the output stream. Runs on the device worker thread.
fn build_output_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    fault_tx: crossbeam_channel::Sender<String>,
) -> Result<(cpal::Stream, ())> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                LiveError::DeviceUnavailable(format!("output device '{name}' not found"))
            })?
    } else {
        host.default_output_device()
            .ok_or_else(|| LiveError::DeviceUnavailable("no default output device".into()))?
    };

    let name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {name}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut mixer = match mixer.lock() {
                    Ok(m) => m,
                    Err(p) => p.into_inner(),
                };
                mixer.render(data);
            },
            move |err| {
                error!("audio output stream error: {err}");
                let _ = fault_tx.try_send(err.to_string());
            },
            None,
        )
        .map_err(|e| classify_device_error("failed to build output stream", &e.to_string()))?;

    stream
        .play()
        .map_err(|e| classify_device_error("failed to start output stream", &e.to_string()))?;

    info!("audio playback started: {sample_rate}Hz mono");
    Ok((stream, ()))
}
