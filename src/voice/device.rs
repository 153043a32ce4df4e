//! Device stream ownership
//!
//! cpal streams are not `Send` on every platform, so each stream lives on its
//! own thread for its whole life. The handle returned to callers is `Send` and
//! releases the hardware when stopped or dropped.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::StreamTrait;

use crate::{Error, Result};

/// Hook run once when a handle is released
type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// Releases a device stream when stopped or dropped
#[derive(Default)]
pub struct DeviceHandle {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    on_release: Option<ReleaseHook>,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("running", &self.is_running())
            .field("thread", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

impl DeviceHandle {
    /// Handle that owns nothing (used by devices without a backing stream)
    #[must_use]
    pub fn detached() -> Self {
        Self::default()
    }

    /// Handle without a stream that runs `release` once when stopped or dropped
    ///
    /// Lets devices that are not backed by cpal report their release.
    #[must_use]
    pub fn with_release<F>(release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            stop_tx: None,
            thread: None,
            on_release: Some(Box::new(release)),
        }
    }

    /// Whether the underlying stream is still held
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }

    /// Stop the stream and release the device; calling twice is a no-op
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("device thread panicked");
            }
        }
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build and start a stream on a dedicated thread
///
/// `build` runs on the new thread; its error is returned to the caller and
/// no thread is left behind.
///
/// # Errors
///
/// Returns whatever `build` returns, or `Error::Audio` if the stream fails to
/// start or the thread cannot be spawned
pub fn spawn_stream<F>(name: &str, build: F) -> Result<DeviceHandle>
where
    F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(Error::Audio(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Hold the stream until stopped or the handle is dropped
            let _ = stop_rx.recv();
            drop(stream);
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(DeviceHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            on_release: None,
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(Error::Audio(format!("{name} thread exited before start")))
        }
    }
}
