//! Session and conversation state

use serde::Serialize;

/// Connection lifecycle of the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    /// Whether moving to `next` is a legal transition
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        use ConnectionState::{Closed, Connecting, Errored, Idle, Open};
        matches!(
            (self, next),
            (_, Idle)
                | (Idle | Closed | Errored, Connecting)
                | (Connecting, Open)
                | (Connecting | Open, Closed | Errored)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Errored => "errored",
        };
        f.write_str(label)
    }
}

/// What the assistant appears to be doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvatarState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl std::fmt::Display for AvatarState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "IDLE",
            Self::Listening => "LISTENING",
            Self::Thinking => "THINKING",
            Self::Speaking => "SPEAKING",
        };
        f.write_str(label)
    }
}

/// Who the current transcript belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Ai,
}

/// The in-progress transcript line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transcript {
    pub speaker: Speaker,
    pub text: String,
}

impl Transcript {
    /// A user fragment replaces whatever was shown
    #[must_use]
    pub fn user(text: &str) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.to_string(),
        }
    }

    /// An assistant fragment extends an assistant line, otherwise starts a new one
    #[must_use]
    pub fn append_ai(previous: Option<&Self>, text: &str) -> Self {
        match previous {
            Some(prev) if prev.speaker == Speaker::Ai => Self {
                speaker: Speaker::Ai,
                text: format!("{} {text}", prev.text),
            },
            _ => Self {
                speaker: Speaker::Ai,
                text: text.to_string(),
            },
        }
    }
}

/// Observable controller state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// User started a call and has not ended it
    pub started: bool,
    pub connection: ConnectionState,
    pub avatar: AvatarState,
    /// Connecting or waiting on the model
    pub processing: bool,
    pub muted: bool,
    pub volume: f32,
    /// Output level in [0, 1]; zero unless speaking
    pub level: f32,
    pub transcript: Option<Transcript>,
    /// Transient status banner
    pub status: Option<String>,
    /// Current retry attempt (0 when healthy)
    pub retry_attempt: u32,
    /// Whether the board currently shows content
    pub board_visible: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            started: false,
            connection: ConnectionState::Idle,
            avatar: AvatarState::Idle,
            processing: false,
            muted: false,
            volume: 0.8,
            level: 0.0,
            transcript: None,
            status: None,
            retry_attempt: 0,
            board_visible: false,
        }
    }
}
