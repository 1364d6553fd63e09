//! Configuration types for the live voice session.

use crate::error::{LiveError, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Top-level configuration for a live session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Capture pipeline tuning (metering, queueing).
    pub capture: CaptureConfig,
    /// Voice service connection settings.
    pub service: ServiceConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate of the PCM sent to the service, in Hz.
    pub input_sample_rate: u32,
    /// Sample rate of the PCM received from the service, in Hz.
    pub output_sample_rate: u32,
    /// Samples per captured frame (after resampling to the input rate).
    pub frame_samples: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_samples: 4096,
            input_device: None,
            output_device: None,
        }
    }
}

/// Capture pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Gain applied to the mean absolute amplitude before clamping to \[0, 1\].
    ///
    /// Speech rarely exceeds a mean amplitude of 0.2, so a gain of 5 makes
    /// the meter use its full range.
    pub volume_gain: f32,
    /// Frames held between capture and transport before the oldest is dropped.
    pub queue_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            volume_gain: 5.0,
            queue_capacity: 32,
        }
    }
}

/// Voice service connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// WebSocket endpoint of the live service.
    pub url: String,
    /// Model identifier sent in the setup message.
    pub model: String,
    /// Prebuilt voice used for synthesized replies.
    pub voice: String,
    /// Modality requested for replies.
    pub response_modality: String,
    /// Persona/system instruction sent at setup.
    pub system_instruction: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_owned(),
            model: "models/gemini-2.5-flash-native-audio-preview-12-2025".to_owned(),
            voice: "Kore".to_owned(),
            response_modality: "AUDIO".to_owned(),
            system_instruction: default_system_instruction(),
            api_key_env: "GEMINI_API_KEY".to_owned(),
        }
    }
}

fn default_system_instruction() -> String {
    "You are Marta, a warm, articulate and thoughtful assistant. Speak naturally, \
     as a well-read person would in conversation. Keep spoken answers concise, \
     adapt your tone to the user, and never read out formatting or markup."
        .to_owned()
}

impl LiveConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| LiveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| LiveError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values that would make the pipeline misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.audio.input_sample_rate == 0 {
            return Err(LiveError::Config("audio.input_sample_rate must be > 0".into()));
        }
        if self.audio.output_sample_rate == 0 {
            return Err(LiveError::Config("audio.output_sample_rate must be > 0".into()));
        }
        if self.audio.frame_samples == 0 {
            return Err(LiveError::Config("audio.frame_samples must be > 0".into()));
        }
        let gain = self.capture.volume_gain;
        if !gain.is_finite() || gain <= 0.0 {
            return Err(LiveError::Config("capture.volume_gain must be > 0".into()));
        }
        if self.capture.queue_capacity == 0 {
            return Err(LiveError::Config("capture.queue_capacity must be > 0".into()));
        }
        if self.service.url.trim().is_empty() {
            return Err(LiveError::Config("service.url must not be empty".into()));
        }
        Ok(())
    }

    /// Default config file: `live.toml` inside [`config_dir`].
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        config_dir().join("live.toml")
    }
}

/// Marta config directory.
///
/// Resolves to `dirs::config_dir()/marta/` (`~/.config/marta` on Linux,
/// `~/Library/Application Support/marta` on macOS). Override with the
/// `MARTA_CONFIG_DIR` environment variable.
#[must_use]
pub fn config_dir() -> PathBuf {
    resolve_config_dir(std::env::var_os("MARTA_CONFIG_DIR"))
}

fn resolve_config_dir(override_dir: Option<OsString>) -> PathBuf {
    if let Some(dir) = override_dir {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .map(|d| d.join("marta"))
        .unwrap_or_else(|| PathBuf::from("/tmp/marta-config"))
}
