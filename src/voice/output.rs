//! Audio output to speakers
//!
//! The device callback renders the shared graph directly, so the graph clock
//! advances at hardware pace.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleRate, StreamConfig};

use super::device::{DeviceHandle, spawn_stream};
use super::graph::{self, SharedGraph};
use crate::{Error, Result};

/// Sample rate for playback (matches the synthesized speech rate)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Speaker sink abstraction
pub trait AudioOutput: Send + Sync {
    /// Open the output device and start rendering the graph
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if no suitable output device is available
    fn open(&self, graph: SharedGraph) -> Result<DeviceHandle>;
}

/// Plays the output graph on the default output device
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalOutput;

impl AudioOutput for CpalOutput {
    fn open(&self, graph: SharedGraph) -> Result<DeviceHandle> {
        let sample_rate = graph::lock(&graph).sample_rate();
        spawn_stream("speaker-output", move || {
            build_output_stream(sample_rate, graph)
        })
    }
}

fn build_output_stream(sample_rate: u32, graph: SharedGraph) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.sample_format() == cpal::SampleFormat::F32
            && c.min_sample_rate() <= SampleRate(sample_rate)
            && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| supports(c, 1))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio output initialized"
    );

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                graph::lock(&graph).render(data, channels);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}
