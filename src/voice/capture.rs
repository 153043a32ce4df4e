//! Audio capture from microphone
//!
//! The device callback downmixes to mono, resamples to the speech rate when
//! the hardware cannot run at it, and cuts the stream into fixed-size frames.
//! Frames are handed off with `try_send`; the callback never waits on the
//! consumer.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use rubato::{FftFixedIn, Resampler};
use tokio::sync::mpsc;

use super::device::{DeviceHandle, spawn_stream};
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per captured frame
pub const FRAME_SIZE: usize = 2048;

/// Resampler input block when the device runs at another rate
const RESAMPLE_CHUNK: usize = 1024;

/// One fixed-size block of mono microphone samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Capture order, starting at zero for each opened stream
    pub sequence: u64,
    /// Mono samples in [-1, 1]
    pub samples: Vec<f32>,
}

/// Microphone source abstraction
pub trait AudioInput: Send + Sync {
    /// Open the microphone and start delivering frames
    ///
    /// # Errors
    ///
    /// Returns `Error::MediaAccess` if the microphone is denied or missing
    fn open(&self, frames: mpsc::Sender<AudioFrame>) -> Result<DeviceHandle>;
}

/// Captures audio from the default input device
#[derive(Debug, Clone)]
pub struct CpalInput {
    sample_rate: u32,
    frame_size: usize,
}

impl Default for CpalInput {
    fn default() -> Self {
        Self::new(SAMPLE_RATE, FRAME_SIZE)
    }
}

impl CpalInput {
    /// Create a capture source producing frames at the given rate and size
    #[must_use]
    pub const fn new(sample_rate: u32, frame_size: usize) -> Self {
        Self {
            sample_rate,
            frame_size,
        }
    }
}

impl AudioInput for CpalInput {
    fn open(&self, frames: mpsc::Sender<AudioFrame>) -> Result<DeviceHandle> {
        let target_rate = self.sample_rate;
        let frame_size = self.frame_size;

        spawn_stream("mic-capture", move || {
            build_input_stream(target_rate, frame_size, frames)
        })
    }
}

fn build_input_stream(
    target_rate: u32,
    frame_size: usize,
    frames: mpsc::Sender<AudioFrame>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MediaAccess("no input device available".to_string()))?;

    let preferred = device
        .supported_input_configs()
        .map_err(|e| Error::MediaAccess(e.to_string()))?
        .find(|c| {
            c.min_sample_rate() <= SampleRate(target_rate)
                && c.max_sample_rate() >= SampleRate(target_rate)
        })
        .map(|c| c.with_sample_rate(SampleRate(target_rate)));

    let supported = match preferred {
        Some(c) => c,
        None => device
            .default_input_config()
            .map_err(|e| Error::MediaAccess(e.to_string()))?,
    };

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        device_rate = config.sample_rate.0,
        target_rate,
        channels,
        "audio capture initialized"
    );

    let mut assembler = FrameAssembler::new(config.sample_rate.0, target_rate, frame_size)?;
    let mut deliver = move |mono: &[f32]| {
        for frame in assembler.push(mono) {
            if frames.try_send(frame).is_err() {
                tracing::trace!("capture consumer behind, frame dropped");
            }
        }
    };

    let err_fn = |err| tracing::error!(error = %err, "audio capture error");

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                deliver(&downmix(data, channels));
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                deliver(&downmix(&floats, channels));
            },
            err_fn,
            None,
        ),
        other => {
            return Err(Error::MediaAccess(format!(
                "unsupported sample format: {other:?}"
            )));
        }
    }
    .map_err(|e| Error::MediaAccess(e.to_string()))?;

    Ok(stream)
}

/// Average interleaved channels into mono
#[must_use]
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    #[allow(clippy::cast_precision_loss)]
    let scale = 1.0 / channels as f32;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

/// Cuts a continuous mono stream into fixed-size frames at the target rate
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
    resampler: Option<FftFixedIn<f32>>,
    resample_in: Vec<f32>,
    sequence: u64,
}

impl std::fmt::Debug for FrameAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAssembler")
            .field("frame_size", &self.frame_size)
            .field("pending", &self.pending.len())
            .field("resampling", &self.resampler.is_some())
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl FrameAssembler {
    /// Create an assembler converting from `source_rate` to `target_rate`
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the rate pair cannot be resampled
    pub fn new(source_rate: u32, target_rate: u32, frame_size: usize) -> Result<Self> {
        let resampler = if source_rate == target_rate {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(
                    source_rate as usize,
                    target_rate as usize,
                    RESAMPLE_CHUNK,
                    2,
                    1,
                )
                .map_err(|e| Error::Audio(e.to_string()))?,
            )
        };

        Ok(Self {
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size * 2),
            resampler,
            resample_in: Vec::new(),
            sequence: 0,
        })
    }

    /// Feed mono samples at the source rate, returning every completed frame
    pub fn push(&mut self, mono: &[f32]) -> Vec<AudioFrame> {
        match self.resampler.as_mut() {
            None => self.pending.extend_from_slice(mono),
            Some(resampler) => {
                self.resample_in.extend_from_slice(mono);
                loop {
                    let needed = resampler.input_frames_next();
                    if self.resample_in.len() < needed {
                        break;
                    }
                    let block: Vec<f32> = self.resample_in.drain(..needed).collect();
                    match resampler.process(&[block], None) {
                        Ok(mut out) => {
                            if let Some(channel) = out.pop() {
                                self.pending.extend(channel);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "capture resampling failed, block dropped");
                        }
                    }
                }
            }
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let samples: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            frames.push(AudioFrame {
                sequence: self.sequence,
                samples,
            });
            self.sequence += 1;
        }
        frames
    }
}

/// Convert f32 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_fixed_size_and_ordered() {
        let mut assembler = FrameAssembler::new(16000, 16000, 4).unwrap();

        assert!(assembler.push(&[0.1, 0.2, 0.3]).is_empty());
        let frames = assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(frames[0].samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[1].sequence, 1);
        assert_eq!(frames[1].samples, vec![0.5, 0.6, 0.7, 0.8]);

        let frames = assembler.push(&[1.0, 1.0, 1.0]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sequence, 2);
    }

    #[test]
    fn resamples_to_target_rate() {
        let mut assembler = FrameAssembler::new(48000, 16000, 256).unwrap();

        // One second at 48kHz yields roughly one second at 16kHz
        let input = vec![0.0; 48000];
        let frames = assembler.push(&input);
        let produced: usize = frames.iter().map(|f| f.samples.len()).sum();

        assert!(produced > 14000, "produced {produced}");
        assert!(produced <= 16000, "produced {produced}");
        assert!(frames.iter().all(|f| f.samples.len() == 256));
    }

    #[test]
    fn downmix_averages_channels() {
        let mono = downmix(&[0.2, 0.4, -0.2, -0.4], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!((mono[1] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn wav_export_has_header_and_samples() {
        let wav = samples_to_wav(&[0.0; 100], SAMPLE_RATE).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(wav.len(), 44 + 200);
    }
}
