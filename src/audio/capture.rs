//! Microphone audio capture using cpal.
//!
//! Captures at the device's native sample rate and channel count and
//! down-mixes to mono. Rate conversion to the wire format happens later in
//! the capture pipeline, off the audio thread.

use crate::audio::codec::to_mono;
use crate::audio::{DeviceWorker, MicStream, MicrophoneSource, classify_device_error};
use crate::config::AudioConfig;
use crate::error::{LiveError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Raw blocks buffered between the audio callback and the capture pipeline.
const RAW_CHANNEL_SIZE: usize = 64;

/// Microphone capture from the system input device via cpal.
pub struct CpalMicrophone {
    device_name: Option<String>,
    worker: Option<DeviceWorker>,
}

impl CpalMicrophone {
    /// Create a microphone bound to `config.input_device` (or the default device).
    ///
    /// Nothing is opened until [`MicrophoneSource::open`].
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
            worker: None,
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl MicrophoneSource for CpalMicrophone {
    fn open(&mut self) -> Result<MicStream> {
        if self.worker.is_some() {
            return Err(LiveError::DeviceUnavailable("microphone already open".into()));
        }

        let (tx, rx) = mpsc::channel::<Vec<f32>>(RAW_CHANNEL_SIZE);
        let device_name = self.device_name.clone();
        // A fault drops the stream, which closes `rx`; capture reports the loss.
        let (worker, sample_rate) = DeviceWorker::spawn(
            "marta-mic",
            move |fault_tx| build_input_stream(device_name.as_deref(), tx, fault_tx),
            |_| {},
        )?;
        self.worker = Some(worker);

        Ok(MicStream { sample_rate, rx })
    }

    fn close(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            info!("audio capture stopped");
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.close();
    }
}

fn find_input_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    if let Some(name) = name {
        host.input_devices()
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| LiveError::DeviceUnavailable(format!("input device '{name}' not found")))
    } else {
        host.default_input_device()
            .ok_or_else(|| LiveError::DeviceUnavailable("no default input device".into()))
    }
}

/// Build and start the input stream. Runs on the device worker thread.
fn build_input_stream(
    device_name: Option<&str>,
    tx: mpsc::Sender<Vec<f32>>,
    fault_tx: crossbeam_channel::Sender<String>,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = find_input_device(&host, device_name)?;

    let name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using input device: {name}");

    // Use the device's default config for best compatibility
    let default_config = device
        .default_input_config()
        .map_err(|e| classify_device_error("no default input config", &e.to_string()))?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();

    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = to_mono(data, native_channels);
                // Never block the audio thread.
                if tx.try_send(mono).is_err() {
                    debug!("raw capture channel full, dropping block");
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
                let _ = fault_tx.try_send(err.to_string());
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                LiveError::DeviceUnavailable(format!("input device '{name}' is not available"))
            }
            other => classify_device_error("failed to build input stream", &other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| classify_device_error("failed to start input stream", &e.to_string()))?;

    info!(
        "audio capture started: {}Hz, {} channel(s)",
        native_rate, native_channels
    );

    Ok((stream, native_rate))
}
