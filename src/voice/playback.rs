//! Gapless playback scheduling on the shared output clock
//!
//! Inbound chunks arrive faster than real time. Each one is placed at
//! `max(cursor, now)` and the cursor moves past it immediately, so chunks play
//! back-to-back in arrival order without gaps or overlaps, and start late
//! (rather than in the past) when the network falls behind.

use std::collections::HashSet;

use super::graph::{self, SharedGraph, SourceId};
use crate::{Result, codec};

/// Decoded audio ready for scheduling
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Wrap per-channel samples
    #[must_use]
    pub const fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    /// Build a mono buffer
    #[must_use]
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(vec![samples], sample_rate)
    }

    /// Decode little-endian 16-bit PCM
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if the bytes do not split into whole frames
    pub fn from_pcm16(bytes: &[u8], channels: usize, sample_rate: u32) -> Result<Self> {
        Ok(Self::new(codec::pcm16_to_float(bytes, channels)?, sample_rate))
    }

    /// Frames per channel
    #[must_use]
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Number of channels
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Sample rate of the buffer
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Playback duration in seconds
    #[must_use]
    pub fn duration(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let frames = self.frames() as f64;
        frames / f64::from(self.sample_rate)
    }

    /// Samples of one channel
    #[must_use]
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Average all channels down to one
    #[must_use]
    pub fn into_mono(mut self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels.remove(0),
            n => {
                #[allow(clippy::cast_precision_loss)]
                let scale = 1.0 / n as f32;
                (0..self.frames())
                    .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() * scale)
                    .collect()
            }
        }
    }
}

/// Where a chunk landed on the timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    /// Source identifier in the graph
    pub id: SourceId,
    /// Start time on the output clock (seconds)
    pub start: f64,
    /// Chunk duration (seconds)
    pub duration: f64,
}

/// Places chunks on the output timeline and tracks what is playing
#[derive(Debug)]
pub struct PlaybackScheduler {
    graph: SharedGraph,
    cursor: f64,
    active: HashSet<SourceId>,
    next_id: SourceId,
}

impl PlaybackScheduler {
    /// Create a scheduler over a shared graph
    #[must_use]
    pub fn new(graph: SharedGraph) -> Self {
        Self {
            graph,
            cursor: 0.0,
            active: HashSet::new(),
            next_id: 1,
        }
    }

    /// Schedule a chunk right after everything already scheduled
    pub fn schedule_chunk(&mut self, buffer: AudioBuffer) -> ScheduledChunk {
        let duration = buffer.duration();
        let id = self.next_id;
        self.next_id += 1;

        let mut graph = graph::lock(&self.graph);
        let start = self.cursor.max(graph.now());
        graph.start(id, buffer.into_mono(), start);
        drop(graph);

        self.active.insert(id);
        // Advance now, not on completion, so back-to-back chunks never overlap
        self.cursor = start + duration;

        tracing::trace!(id, start, duration, cursor = self.cursor, "chunk scheduled");
        ScheduledChunk {
            id,
            start,
            duration,
        }
    }

    /// Record natural completion of a source
    ///
    /// Returns `true` when this was the last active source, meaning playback
    /// just went idle after speaking. Unknown ids (already stopped) return `false`.
    pub fn on_source_ended(&mut self, id: SourceId) -> bool {
        self.active.remove(&id) && self.active.is_empty()
    }

    /// Stop every active source immediately and clear the set
    ///
    /// The cursor is left alone: it is clamped against the clock on the next
    /// schedule, so stale future times self-correct. Returns how many sources
    /// were stopped.
    pub fn interrupt_all(&mut self) -> usize {
        if self.active.is_empty() {
            return 0;
        }

        let mut graph = graph::lock(&self.graph);
        let count = self.active.len();
        for id in self.active.drain() {
            // Already-finished sources are a no-op in the graph
            graph.stop(id);
        }

        tracing::debug!(count, "playback interrupted");
        count
    }

    /// Stop everything and drop the graph's remaining state
    pub fn shutdown(&mut self) {
        self.active.clear();
        graph::lock(&self.graph).clear();
    }

    /// Live volume change applied uniformly to all chunks
    pub fn set_volume(&self, volume: f32) {
        graph::lock(&self.graph).set_gain(volume);
    }

    /// Normalized output level from the analyser
    #[must_use]
    pub fn level(&self) -> f32 {
        graph::lock(&self.graph).level()
    }

    /// Current output clock time in seconds
    #[must_use]
    pub fn now(&self) -> f64 {
        graph::lock(&self.graph).now()
    }

    /// Timeline cursor: earliest start for the next chunk
    #[must_use]
    pub const fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Number of chunks started but not yet finished or stopped
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Whether a source is in the active set
    #[must_use]
    pub fn is_active(&self, id: SourceId) -> bool {
        self.active.contains(&id)
    }

    /// The shared output graph
    #[must_use]
    pub const fn graph(&self) -> &SharedGraph {
        &self.graph
    }
}
