//! Voice processing module
//!
//! Handles microphone capture, the outbound capture pipeline, and gapless
//! playback of synthesized speech through a shared output graph.

mod analyzer;
mod capture;
mod device;
mod graph;
mod output;
mod pipeline;
mod playback;

pub use analyzer::{Analyzer, BIN_COUNT, FFT_SIZE};
pub use capture::{
    AudioFrame, AudioInput, CpalInput, FRAME_SIZE, FrameAssembler, SAMPLE_RATE, downmix,
    samples_to_wav,
};
pub use device::{DeviceHandle, spawn_stream};
pub use graph::{EndedCallback, OutputGraph, SharedGraph, SourceId, lock as lock_graph};
pub use output::{AudioOutput, CpalOutput, PLAYBACK_SAMPLE_RATE};
pub use pipeline::{CapturePipeline, FrameOutcome, pcm_mime_type};
pub use playback::{AudioBuffer, PlaybackScheduler, ScheduledChunk};
