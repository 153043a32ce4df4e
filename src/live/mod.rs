//! Remote live session contract
//!
//! A `Connector` opens one bidirectional session and reports everything that
//! happens on it through a `LinkSender`. Every report carries the generation
//! of the attempt that produced it, so the controller can ignore stragglers
//! from sessions it has already abandoned.

pub mod gemini;
mod message;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::mpsc;

pub use gemini::GeminiConnector;
pub use message::{
    ClientMessage, FunctionCall, FunctionDeclaration, FunctionResponse, GoAway, InlineData,
    ModelTurn, Part, ServerContent, ServerMessage, SessionSetup, ToolCall, Transcription,
};

use crate::Result;

/// Outbound half of an open session
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Send one encoded audio frame
    async fn send_audio(&self, data: String, mime_type: &str) -> Result<()>;

    /// Acknowledge one tool call
    async fn send_tool_response(&self, response: FunctionResponse) -> Result<()>;

    /// Close the session; closing a broken session is not an error
    async fn close(&self) -> Result<()>;
}

/// Opens sessions against a remote endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and send `setup`; returns once the transport is up
    ///
    /// The handshake completes later with `LinkEvent::Opened`.
    async fn connect(
        &self,
        setup: &SessionSetup,
        credential: &SecretString,
        link: LinkSender,
    ) -> Result<Arc<dyn LiveSession>>;
}

/// Something that happened on a session
#[derive(Debug)]
pub enum LinkEvent {
    /// Handshake complete; the session accepts audio
    Opened,
    /// One inbound frame
    Message(Box<ServerMessage>),
    /// Transport error
    Error(String),
    /// The remote side closed the session
    Closed(Option<String>),
}

/// A link event tagged with the attempt that produced it
#[derive(Debug)]
pub struct LinkEnvelope {
    pub generation: u64,
    pub event: LinkEvent,
}

/// Reports link events for one connection attempt
#[derive(Debug, Clone)]
pub struct LinkSender {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEnvelope>,
}

impl LinkSender {
    /// Create a sender for the given attempt
    #[must_use]
    pub const fn new(generation: u64, tx: mpsc::UnboundedSender<LinkEnvelope>) -> Self {
        Self { generation, tx }
    }

    /// Attempt this sender reports for
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event; returns false once the controller is gone
    pub fn send(&self, event: LinkEvent) -> bool {
        self.tx
            .send(LinkEnvelope {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn opened(&self) -> bool {
        self.send(LinkEvent::Opened)
    }

    pub fn message(&self, message: ServerMessage) -> bool {
        self.send(LinkEvent::Message(Box::new(message)))
    }

    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.send(LinkEvent::Error(reason.into()))
    }

    pub fn closed(&self, reason: Option<String>) -> bool {
        self.send(LinkEvent::Closed(reason))
    }
}
