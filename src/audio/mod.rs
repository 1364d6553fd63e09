//! Audio device seams and their cpal implementations.
//!
//! The session core only talks to [`MicrophoneSource`] and [`OutputDevice`];
//! [`AudioBackend`] hands out fresh instances per session so no device
//! handle outlives the session that opened it.

pub mod capture;
pub mod codec;
pub mod playback;

use crate::config::AudioConfig;
use crate::error::{FailureReason, LiveError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identifier of one scheduled output buffer.
pub type HandleId = u64;

/// An opened microphone: mono f32 sample blocks at the device's native rate.
pub struct MicStream {
    /// Native sample rate of the blocks on `rx`, in Hz.
    pub sample_rate: u32,
    /// Blocks in capture order. Closed when the device stops delivering.
    pub rx: mpsc::Receiver<Vec<f32>>,
}

/// A microphone that can be opened once and released.
pub trait MicrophoneSource: Send + 'static {
    /// Request exclusive access to the device and start capturing.
    ///
    /// # Errors
    ///
    /// [`LiveError::PermissionDenied`] if access is refused,
    /// [`LiveError::DeviceUnavailable`] if the device cannot be opened.
    fn open(&mut self) -> Result<MicStream>;

    /// Release the device. Must not return while capture callbacks can still run.
    fn close(&mut self);
}

/// A scheduled buffer on an [`OutputDevice`].
pub trait ScheduledBuffer: Send {
    /// Silence the buffer immediately, whether or not it has started.
    fn stop(&self);
}

/// An output device with its own monotonic playback clock.
pub trait OutputDevice: Send + Sync {
    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Current position of the device clock.
    fn now(&self) -> Duration;

    /// Queue `samples` to start at device time `start`.
    ///
    /// When the buffer finishes naturally the device sends `id` on `ended`.
    /// A stopped buffer never reports.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::DeviceUnavailable`] if the device has been closed.
    fn schedule_buffer(
        &self,
        id: HandleId,
        samples: Arc<[f32]>,
        start: Duration,
        ended: mpsc::UnboundedSender<HandleId>,
    ) -> Result<Box<dyn ScheduledBuffer>>;

    /// Release the device. Scheduled buffers are dropped silently.
    fn close(&self);
}

/// Factory for the per-session audio devices.
pub trait AudioBackend: Send + Sync + 'static {
    /// Create (but do not open) the microphone for one session.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot describe an input device at all.
    fn microphone(&self, config: &AudioConfig) -> Result<Box<dyn MicrophoneSource>>;

    /// Open the output device for one session.
    ///
    /// If the device fails after opening, the failure is sent on `faults`
    /// once as [`FailureReason::DeviceUnavailable`].
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::DeviceUnavailable`] if no output device can be opened.
    fn open_output(
        &self,
        config: &AudioConfig,
        faults: mpsc::UnboundedSender<FailureReason>,
    ) -> Result<Arc<dyn OutputDevice>>;
}

/// The system audio devices via cpal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn microphone(&self, config: &AudioConfig) -> Result<Box<dyn MicrophoneSource>> {
        Ok(Box::new(capture::CpalMicrophone::new(config)))
    }

    fn open_output(
        &self,
        config: &AudioConfig,
        faults: mpsc::UnboundedSender<FailureReason>,
    ) -> Result<Arc<dyn OutputDevice>> {
        Ok(Arc::new(playback::CpalOutput::open(config, faults)?))
    }
}

/// A dedicated thread that owns one cpal stream.
///
/// cpal streams are not `Send` on every platform, so the stream is built,
/// played and dropped on the same thread. The thread parks until asked to
/// stop or until the stream's error callback reports a fault, which is
/// handed to `on_fault` after the stream is released.
pub(crate) struct DeviceWorker {
    stop_tx: crossbeam_channel::Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeviceWorker {
    /// Spawn the worker and wait until `build` has produced a playing stream.
    ///
    /// `build` receives a fault sender for the stream's error callback.
    pub(crate) fn spawn<T, F, H>(name: &str, build: F, on_fault: H) -> Result<(Self, T)>
    where
        T: Send + 'static,
        F: FnOnce(crossbeam_channel::Sender<String>) -> Result<(cpal::Stream, T)> + Send + 'static,
        H: FnOnce(String) + Send + 'static,
    {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<T>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let thread_name = name.to_owned();

        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let (fault_tx, fault_rx) = crossbeam_channel::bounded::<String>(1);
                match build(fault_tx) {
                    Ok((stream, info)) => {
                        let _ = ready_tx.send(Ok(info));
                        let fault = crossbeam_channel::select! {
                            recv(stop_rx) -> _ => {
                                debug!(thread = %thread_name, "device stop requested");
                                None
                            }
                            recv(fault_rx) -> msg => {
                                let msg = msg.unwrap_or_default();
                                warn!(
                                    thread = %thread_name,
                                    fault = %msg,
                                    "device stream faulted, releasing"
                                );
                                Some(msg)
                            }
                        };
                        drop(stream);
                        if let Some(msg) = fault {
                            on_fault(msg);
                        }
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        let info = ready_rx
            .recv()
            .map_err(|_| LiveError::DeviceUnavailable(format!("{name} thread exited early")))??;

        Ok((
            Self {
                stop_tx,
                thread: Some(thread),
            },
            info,
        ))
    }

    /// Stop the stream and wait for the thread to release it.
    pub(crate) fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("audio device thread panicked");
        }
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Map a cpal stream-construction error onto the session error taxonomy.
pub(crate) fn classify_device_error(context: &str, message: &str) -> LiveError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission")
        || lower.contains("denied")
        || lower.contains("not authorized")
        || lower.contains("not permitted")
    {
        LiveError::PermissionDenied
    } else {
        LiveError::DeviceUnavailable(format!("{context}: {message}"))
    }
}
