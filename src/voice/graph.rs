//! Shared output graph
//!
//! Every scheduled chunk plays through the same chain: source → gain →
//! analyser → device. The graph owns the output clock, which advances only as
//! frames are rendered, so scheduling is expressed in graph time rather than
//! wall time.

use std::sync::{Arc, Mutex, MutexGuard};

use super::analyzer::Analyzer;

/// Identifier of one scheduled source
pub type SourceId = u64;

/// Graph shared between the scheduler and the device callback
pub type SharedGraph = Arc<Mutex<OutputGraph>>;

/// Callback fired when a source finishes playing on its own
pub type EndedCallback = Box<dyn Fn(SourceId) + Send + Sync>;

/// A chunk placed on the output timeline
#[derive(Debug, Clone)]
struct ScheduledSource {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl ScheduledSource {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Output clock, sources, gain and analyser tap
pub struct OutputGraph {
    sample_rate: u32,
    frames_rendered: u64,
    sources: Vec<ScheduledSource>,
    gain: f32,
    analyzer: Analyzer,
    on_ended: Option<EndedCallback>,
}

impl std::fmt::Debug for OutputGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputGraph")
            .field("sample_rate", &self.sample_rate)
            .field("frames_rendered", &self.frames_rendered)
            .field("sources", &self.sources.len())
            .field("gain", &self.gain)
            .finish_non_exhaustive()
    }
}

impl OutputGraph {
    /// Create a graph at the given output rate with an initial gain
    #[must_use]
    pub fn new(sample_rate: u32, gain: f32) -> Self {
        Self {
            sample_rate,
            frames_rendered: 0,
            sources: Vec::new(),
            gain,
            analyzer: Analyzer::new(),
            on_ended: None,
        }
    }

    /// Wrap the graph for sharing with a device callback
    #[must_use]
    pub fn shared(self) -> SharedGraph {
        Arc::new(Mutex::new(self))
    }

    /// Register the natural-completion callback
    pub fn set_on_ended(&mut self, callback: EndedCallback) {
        self.on_ended = Some(callback);
    }

    /// Output sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current clock time in seconds
    #[must_use]
    pub fn now(&self) -> f64 {
        frames_to_seconds(self.frames_rendered, self.sample_rate)
    }

    /// Current clock time in frames
    #[must_use]
    pub const fn frame_position(&self) -> u64 {
        self.frames_rendered
    }

    /// Current gain
    #[must_use]
    pub const fn gain(&self) -> f32 {
        self.gain
    }

    /// Change the gain; applies to everything rendered from now on
    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    /// Place mono samples on the timeline starting at `start` seconds
    pub fn start(&mut self, id: SourceId, samples: Vec<f32>, start: f64) {
        let start_frame = seconds_to_frames(start, self.sample_rate);
        self.sources.push(ScheduledSource {
            id,
            start_frame,
            samples,
        });
    }

    /// Stop a source immediately; stopping an unknown or finished source is a no-op
    ///
    /// Returns whether a source was actually removed
    pub fn stop(&mut self, id: SourceId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.id != id);
        before != self.sources.len()
    }

    /// Number of sources still on the timeline
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Render interleaved output, advancing the clock by `out.len() / channels` frames
    ///
    /// Sources that reach their end during this block are removed and
    /// reported through the ended callback.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        for (i, frame) in out.chunks_mut(channels).take(frames).enumerate() {
            let t = self.frames_rendered + i as u64;
            let mut mix = 0.0f32;
            for source in &self.sources {
                if t >= source.start_frame && t < source.end_frame() {
                    #[allow(clippy::cast_possible_truncation)]
                    let offset = (t - source.start_frame) as usize;
                    mix += source.samples[offset];
                }
            }

            let value = mix * self.gain;
            self.analyzer.push(value);
            frame.fill(value);
        }

        self.frames_rendered += frames as u64;
        self.collect_finished();
    }

    /// Normalized output level from the analyser
    pub fn level(&mut self) -> f32 {
        self.analyzer.level()
    }

    /// Drop every source and reset the analyser without firing callbacks
    pub fn clear(&mut self) {
        self.sources.clear();
        self.analyzer.reset();
    }

    fn collect_finished(&mut self) {
        let now = self.frames_rendered;
        let mut finished = Vec::new();
        self.sources.retain(|s| {
            if s.end_frame() <= now {
                finished.push(s.id);
                false
            } else {
                true
            }
        });

        if let Some(callback) = &self.on_ended {
            for id in finished {
                callback(id);
            }
        }
    }
}

/// Lock a shared graph, recovering from a poisoned mutex
pub fn lock(graph: &SharedGraph) -> MutexGuard<'_, OutputGraph> {
    graph
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[allow(clippy::cast_precision_loss)]
fn frames_to_seconds(frames: u64, sample_rate: u32) -> f64 {
    frames as f64 / f64::from(sample_rate)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn seconds_to_frames(seconds: f64, sample_rate: u32) -> u64 {
    (seconds.max(0.0) * f64::from(sample_rate)).round() as u64
}
