//! Auxiliary content board
//!
//! Holds at most one piece of assistant-provided markup at a time and
//! broadcasts show/hide changes to connected renderers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};

/// Channel capacity for board updates
const CHANNEL_CAPACITY: usize = 64;

/// Content pushed by the assistant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayContent {
    /// Optional heading shown above the frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Complete self-contained document (markup, style and script)
    pub html: String,
}

/// Board change sent to renderers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoardCommand {
    /// Replace whatever is shown
    Show { content: DisplayContent },
    /// Clear the board
    Hide,
}

/// Board state
///
/// Maintains the current content and broadcasts updates to subscribers.
#[derive(Debug)]
pub struct Board {
    current: Option<DisplayContent>,
    tx: broadcast::Sender<BoardCommand>,
}

/// Board shared between the controller and the HTTP surface
pub type SharedBoard = Arc<Mutex<Board>>;

impl Default for Board {
    fn default() -> Self {
        Self::new()
    }
}

impl Board {
    /// Create an empty board
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { current: None, tx }
    }

    /// Create an empty board behind a shared lock
    #[must_use]
    pub fn shared() -> SharedBoard {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Subscribe to board updates
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BoardCommand> {
        self.tx.subscribe()
    }

    /// Show content, replacing any previous content
    pub fn show(&mut self, content: DisplayContent) {
        self.current = Some(content.clone());

        // No subscribers is fine
        let _ = self.tx.send(BoardCommand::Show { content });
    }

    /// Clear the board
    ///
    /// Returns true if something was shown
    pub fn hide(&mut self) -> bool {
        let was_visible = self.current.take().is_some();
        if was_visible {
            let _ = self.tx.send(BoardCommand::Hide);
        }
        was_visible
    }

    /// Content currently shown
    #[must_use]
    pub const fn current(&self) -> Option<&DisplayContent> {
        self.current.as_ref()
    }

    #[must_use]
    pub const fn is_visible(&self) -> bool {
        self.current.is_some()
    }
}
