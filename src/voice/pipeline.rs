//! Capture pipeline: microphone frames to the live session
//!
//! Runs as one task per session attempt. Frames are forwarded in capture
//! order; a frame captured while muted or with no bound session is dropped
//! outright and never replayed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};

use super::capture::AudioFrame;
use crate::codec;
use crate::live::LiveSession;

/// What happened to one captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Encoded and handed to the session
    Sent,
    /// Dropped because the microphone is muted
    Muted,
    /// Dropped because no session is open
    NoSession,
    /// The session rejected the frame; logged and skipped
    Failed,
}

/// Forwards captured frames to whichever session is currently bound
#[derive(Clone)]
pub struct CapturePipeline {
    muted: Arc<AtomicBool>,
    session: watch::Receiver<Option<Arc<dyn LiveSession>>>,
    mime_type: String,
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("muted", &self.muted.load(Ordering::Relaxed))
            .field("bound", &self.session.borrow().is_some())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

impl CapturePipeline {
    /// Create a pipeline reading the shared mute flag and session binding
    #[must_use]
    pub fn new(
        muted: Arc<AtomicBool>,
        session: watch::Receiver<Option<Arc<dyn LiveSession>>>,
        sample_rate: u32,
    ) -> Self {
        Self {
            muted,
            session,
            mime_type: pcm_mime_type(sample_rate),
        }
    }

    /// MIME type attached to every outbound frame
    #[must_use]
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Drain frames until the capture side hangs up
    pub async fn run(self, mut frames: mpsc::Receiver<AudioFrame>) {
        let mut sent = 0u64;
        let mut dropped = 0u64;

        while let Some(frame) = frames.recv().await {
            match self.forward(&frame).await {
                FrameOutcome::Sent => sent += 1,
                _ => dropped += 1,
            }
        }

        tracing::debug!(sent, dropped, "capture pipeline stopped");
    }

    /// Encode one frame and send it, unless muted or unbound
    pub async fn forward(&self, frame: &AudioFrame) -> FrameOutcome {
        if self.muted.load(Ordering::Relaxed) {
            return FrameOutcome::Muted;
        }

        // Clone out of the watch so the borrow is not held across the send
        let Some(session) = self.session.borrow().clone() else {
            return FrameOutcome::NoSession;
        };

        let data = codec::encode_bytes(&codec::float_to_pcm16(&frame.samples));
        match session.send_audio(data, &self.mime_type).await {
            Ok(()) => FrameOutcome::Sent,
            Err(e) => {
                tracing::debug!(sequence = frame.sequence, error = %e, "frame send failed");
                FrameOutcome::Failed
            }
        }
    }
}

/// MIME type for 16-bit PCM at the given rate
#[must_use]
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_type_carries_rate() {
        assert_eq!(pcm_mime_type(16000), "audio/pcm;rate=16000");
    }
}
