//! Conversions between PCM audio and the wire transport
//!
//! The transport carries raw little-endian 16-bit PCM as base64 text. Inbound
//! chunks are normalized to `f32` in [-1, 1] per channel; outbound frames go
//! the other way.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::{Error, Result};

/// Scale between 16-bit PCM and normalized float samples
const PCM16_SCALE: f32 = 32768.0;

/// Encode bytes into transport text
#[must_use]
pub fn encode_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode transport text back into bytes
///
/// # Errors
///
/// Returns `Error::Decode` if the input contains non-alphabet characters
/// or has invalid padding
pub fn decode_bytes(text: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(text)?)
}

/// Reinterpret little-endian 16-bit PCM as per-channel float buffers
///
/// Samples are de-interleaved and divided by 32768.
///
/// # Errors
///
/// Returns `Error::Format` if the byte count is odd, the channel count is
/// zero, or the sample count is not a multiple of the channel count
pub fn pcm16_to_float(bytes: &[u8], channels: usize) -> Result<Vec<Vec<f32>>> {
    if channels == 0 {
        return Err(Error::Format("channel count must be non-zero".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(Error::Format(format!(
            "odd byte count {} for 16-bit samples",
            bytes.len()
        )));
    }

    let sample_count = bytes.len() / 2;
    if sample_count % channels != 0 {
        return Err(Error::Format(format!(
            "{sample_count} samples do not divide into {channels} channels"
        )));
    }

    let frames = sample_count / channels;
    let mut out = vec![Vec::with_capacity(frames); channels];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        out[i % channels].push(f32::from(sample) / PCM16_SCALE);
    }

    Ok(out)
}

/// Convert float samples to little-endian 16-bit PCM
///
/// Each sample is scaled by 32768 and truncated. Input outside [-1, 1] is
/// not clamped: it wraps around the 16-bit range.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * PCM16_SCALE) as i32 as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}
