//! Error types for the neural link

use thiserror::Error;

/// Result type alias for neural link operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the neural link
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone denied or unavailable (fatal, never retried)
    #[error("media access error: {0}")]
    MediaAccess(String),

    /// Opening the remote session failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Mid-session transport failure or unexpected close
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed transport bytes
    #[error("decode error: {0}")]
    Decode(String),

    /// Audio payload with an impossible shape
    #[error("format error: {0}")]
    Format(String),

    /// Tool call with an unrecognized name
    #[error("unknown tool: {0}")]
    ToolCall(String),

    /// Audio device or stream error after access was granted
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The remote session is gone
    #[error("session closed")]
    SessionClosed,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether a session-level failure of this kind should go to the retry manager
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Transport(_) | Self::WebSocket(_) | Self::SessionClosed
        )
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Self::Decode(e.to_string())
    }
}
