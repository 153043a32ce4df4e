//! WebSocket session against the Gemini Live endpoint

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{
    ClientMessage, Connector, FunctionResponse, LinkSender, LiveSession, ServerMessage,
    SessionSetup,
};
use crate::{Error, Result};

/// Default bidirectional streaming endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Upper bound on the transport handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Outbound frames queued ahead of the socket
const WRITE_QUEUE: usize = 100;

/// Upper bound on flushing the close frame to a peer that stopped reading
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens sessions over a WebSocket
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    endpoint: Url,
}

impl GeminiConnector {
    /// Create a connector for the given endpoint URL
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL is invalid
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint {endpoint}: {e}")))?;
        Ok(Self { endpoint })
    }

    /// Endpoint without credentials
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn authorized_url(&self, credential: &SecretString) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("key", credential.expose_secret());
        url
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    async fn connect(
        &self,
        setup: &SessionSetup,
        credential: &SecretString,
        link: LinkSender,
    ) -> Result<Arc<dyn LiveSession>> {
        tracing::debug!(
            endpoint = %self.endpoint,
            model = %setup.model,
            generation = link.generation(),
            "connecting live session"
        );

        let url = self.authorized_url(credential);
        let (ws_stream, _response) =
            tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
                .await
                .map_err(|_| Error::Connection("handshake timed out".to_string()))??;

        let (mut write, read) = ws_stream.split();

        // Setup must be the first frame on the wire
        let setup_frame = setup.to_message().to_json()?;
        write.send(Message::Text(setup_frame.into())).await?;

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let write_handle = tokio::spawn(write_loop(write, write_rx, shutdown_rx));
        let read_handle = tokio::spawn(read_loop(read, link));

        Ok(Arc::new(GeminiSession {
            write_tx,
            shutdown,
            read_handle,
            write_handle: Mutex::new(Some(write_handle)),
        }))
    }
}

/// One open WebSocket session
pub struct GeminiSession {
    write_tx: mpsc::Sender<Message>,
    /// Tells the writer to stop sending and close the socket
    shutdown: watch::Sender<bool>,
    read_handle: JoinHandle<()>,
    write_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for GeminiSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiSession")
            .field("closed", &self.write_tx.is_closed())
            .finish_non_exhaustive()
    }
}

impl GeminiSession {
    async fn send_message(&self, message: &ClientMessage) -> Result<()> {
        let frame = message.to_json()?;
        self.write_tx
            .send(Message::Text(frame.into()))
            .await
            .map_err(|_| Error::SessionClosed)
    }
}

#[async_trait]
impl LiveSession for GeminiSession {
    async fn send_audio(&self, data: String, mime_type: &str) -> Result<()> {
        self.send_message(&ClientMessage::audio(data, mime_type)).await
    }

    async fn send_tool_response(&self, response: FunctionResponse) -> Result<()> {
        tracing::debug!(id = %response.id, name = %response.name, "sending tool response");
        self.send_message(&ClientMessage::tool_response(response)).await
    }

    async fn close(&self) -> Result<()> {
        // Never queued behind pending frames, so a full queue cannot hold it up
        self.shutdown.send_replace(true);

        let writer = self
            .write_handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        // The writer bounds its own close handshake
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::debug!(error = %e, "live session writer ended abnormally");
            }
        }
        Ok(())
    }
}

impl Drop for GeminiSession {
    fn drop(&mut self) {
        self.read_handle.abort();
        if let Some(writer) = self
            .write_handle
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            writer.abort();
        }
    }
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closing| *closing) => break,
            msg = rx.recv() => msg,
        };
        let Some(msg) = msg else {
            return;
        };

        // A peer that stopped reading must not keep the writer from closing
        let sent = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closing| *closing) => break,
            sent = write.send(msg) => sent,
        };
        if let Err(e) = sent {
            tracing::debug!(error = %e, "live session write failed");
            return;
        }
    }

    match tokio::time::timeout(CLOSE_TIMEOUT, write.close()).await {
        Ok(Ok(())) => tracing::debug!("live session close frame sent"),
        Ok(Err(e)) => tracing::debug!(error = %e, "live session close failed"),
        Err(_) => tracing::debug!("live session close timed out"),
    }
}

async fn read_loop(mut read: SplitStream<WsStream>, link: LinkSender) {
    let mut opened = false;

    while let Some(result) = read.next().await {
        let payload = match result {
            Ok(Message::Text(text)) => text.as_bytes().to_vec(),
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Close(frame)) => {
                let reason = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()));
                tracing::debug!(reason = ?reason, "live session closed by server");
                link.closed(reason);
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "live session read failed");
                link.error(e.to_string());
                return;
            }
        };

        let message = match ServerMessage::parse(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring unparseable frame");
                continue;
            }
        };

        if let Some(go_away) = &message.go_away {
            tracing::info!(time_left = ?go_away.time_left, "server requested disconnect");
        }

        if message.is_setup_complete() && !opened {
            opened = true;
            if !link.opened() {
                return;
            }
        }

        if !link.message(message) {
            return;
        }
    }

    link.closed(None);
}
