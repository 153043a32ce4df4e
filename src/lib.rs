//! Neural Link - real-time voice link to a conversational AI service
//!
//! This library provides the pieces of a full-duplex voice call:
//! - Microphone capture streamed to the remote session as 16 kHz PCM
//! - Gapless playback of synthesized speech on a shared output clock
//! - A session controller with bounded automatic reconnection
//! - Tool calls that drive an auxiliary content board
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   frames   ┌────────────────────┐   JSON/WS   ┌──────────┐
//! │ Capture      ├───────────►│                    ├────────────►│          │
//! │ (voice)      │            │ Session Controller │             │  Remote  │
//! ├──────────────┤   chunks   │     (session)      │◄────────────┤  session │
//! │ Playback     │◄───────────┤                    │             │  (live)  │
//! │ (voice)      │            └──┬──────────────┬──┘             └──────────┘
//! └──────────────┘               │ tool calls   │ retry timer
//!                        ┌───────▼──────┐ ┌─────▼─────────┐
//!                        │ Board (api)  │ │ Retry Manager │
//!                        └──────────────┘ └───────────────┘
//! ```

pub mod api;
pub mod canvas;
pub mod codec;
pub mod config;
pub mod error;
pub mod live;
pub mod session;
pub mod setup;
pub mod voice;

pub use canvas::{Board, BoardCommand, DisplayContent, SharedBoard};
pub use config::Config;
pub use error::{Error, Result};
pub use live::{Connector, GeminiConnector, LiveSession};
pub use session::{AvatarState, Command, ConnectionState, SessionController, Snapshot};
pub use setup::{ConfigCredentials, CredentialProvider};
