//! PCM sample conversion, resampling and metering helpers.
//!
//! The wire format in both directions is little-endian signed 16-bit mono
//! PCM, base64-encoded inside the service's JSON messages.

use crate::error::{LiveError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Convert f32 samples in \[-1, 1\] to signed 16-bit PCM, clamping out-of-range input.
pub fn encode_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
            if s < 0.0 {
                (s * 32_768.0) as i16
            } else {
                (s * 32_767.0) as i16
            }
        })
        .collect()
}

/// Serialize PCM16 samples as little-endian bytes and base64-encode them.
pub fn pcm16_to_base64(samples: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Decode a base64 PCM16 LE payload into f32 samples.
///
/// # Errors
///
/// Returns [`LiveError::ChunkDecode`] for an empty payload, invalid base64,
/// or an odd number of bytes.
pub fn decode_pcm16_base64(payload: &[u8]) -> Result<Vec<f32>> {
    if payload.is_empty() {
        return Err(LiveError::ChunkDecode("empty payload".into()));
    }
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| LiveError::ChunkDecode(format!("invalid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(LiveError::ChunkDecode("payload decodes to zero bytes".into()));
    }
    if bytes.len() % 2 != 0 {
        return Err(LiveError::ChunkDecode(format!(
            "odd byte count {} for 16-bit PCM",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32_768.0)
        .collect())
}

/// Loudness of a window: mean absolute amplitude times `gain`, clamped to \[0, 1\].
pub fn volume_level(samples: &[f32], gain: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s.abs()).sum();
    let level = (sum / samples.len() as f32) * gain;
    if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = usize::from(channels.max(1));
    if ch == 1 {
        return data.to_vec();
    }
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Streaming linear-interpolation resampler.
///
/// Unlike a one-shot resampler, the fractional read position and the last
/// input sample are carried across calls, so feeding a signal in arbitrary
/// pieces yields the same output as feeding it at once.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    /// Input samples consumed per output sample.
    step: f64,
    /// Read position relative to the start of the next input block.
    /// May be negative (down to -1) when it falls between `last` and the
    /// next block's first sample.
    pos: f64,
    last: Option<f32>,
}

impl LinearResampler {
    pub fn new(src_rate: u32, dst_rate: u32) -> Self {
        let step = if dst_rate == 0 {
            1.0
        } else {
            f64::from(src_rate) / f64::from(dst_rate)
        };
        Self {
            step,
            pos: 0.0,
            last: None,
        }
    }

    /// Whether this resampler is an identity transform.
    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    /// Resample one block, appending output to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if input.is_empty() {
            return;
        }
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }

        let len = input.len() as f64;
        // Interpolation needs the sample at floor(pos) and the one after it.
        while self.pos + 1.0 < len {
            let idx = self.pos.floor();
            let frac = (self.pos - idx) as f32;
            let (a, b) = if idx < 0.0 {
                (self.last.unwrap_or(input[0]), input[0])
            } else {
                let i = idx as usize;
                (input[i], input[i + 1])
            };
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }

        self.pos -= len;
        self.last = input.last().copied();
    }
}
