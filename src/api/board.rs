//! Board renderer routes
//!
//! `GET /` serves a host page with a sandboxed frame (scripts allowed, no
//! same-origin access). The page follows `GET /ws`, which pushes the current
//! content on connect and every change after that. A close signal, either
//! `{"type":"close"}` on the socket or `POST /close`, clears the board.

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::canvas::{BoardCommand, DisplayContent, SharedBoard};

/// Incoming WebSocket message from the renderer
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoardWsIncoming {
    /// User dismissed the board
    Close,
    /// Keepalive
    Ping,
}

/// Outgoing WebSocket message to the renderer
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoardWsOutgoing {
    /// Render this document in the frame
    Show {
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        document: String,
    },
    /// Clear the frame
    Hide,
    Pong,
}

impl From<BoardCommand> for BoardWsOutgoing {
    fn from(command: BoardCommand) -> Self {
        match command {
            BoardCommand::Show { content } => Self::show(&content),
            BoardCommand::Hide => Self::Hide,
        }
    }
}

impl BoardWsOutgoing {
    fn show(content: &DisplayContent) -> Self {
        Self::Show {
            title: content.title.clone(),
            document: frame_document(&content.html),
        }
    }
}

/// Build the board router
pub fn router(board: SharedBoard) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_upgrade))
        .route("/content", get(get_content))
        .route("/close", post(close))
        .with_state(board)
}

/// Wrap assistant markup in the frame's base document
#[must_use]
pub fn frame_document(html: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html style="height: 100%; width: 100%;">
  <head>
    <link href="https://fonts.googleapis.com/css2?family=Inter:wght@400;700&display=swap" rel="stylesheet">
    <style>
      * {{ box-sizing: border-box; }}
      body {{
        margin: 0; padding: 32px;
        background: transparent; color: #f8fafc;
        font-family: 'Inter', sans-serif;
        height: 100%; width: 100%;
        overflow-x: hidden; overflow-y: auto;
      }}
      ::-webkit-scrollbar {{ width: 4px; }}
      ::-webkit-scrollbar-thumb {{ background: rgba(34, 211, 238, 0.3); border-radius: 10px; }}
      .glass {{
        background: rgba(15, 23, 42, 0.8);
        border: 1px solid rgba(34, 211, 238, 0.2);
        border-radius: 20px; padding: 24px;
        box-shadow: 0 10px 40px rgba(0,0,0,0.5);
      }}
    </style>
  </head>
  <body>
{html}
  </body>
</html>"#
    )
}

const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8">
    <title>Neural Board</title>
    <style>
      html, body { margin: 0; height: 100%; background: #080808; color: #f8fafc; font-family: 'Inter', sans-serif; }
      header { display: flex; align-items: center; justify-content: space-between; padding: 12px 20px; }
      h1 { margin: 0; font-size: 12px; letter-spacing: 0.3em; text-transform: uppercase; color: #22d3ee; }
      button { background: none; border: 1px solid rgba(34, 211, 238, 0.3); color: #22d3ee; border-radius: 999px; padding: 4px 14px; cursor: pointer; }
      iframe { border: 0; width: 100%; height: calc(100% - 56px); }
      .idle { display: none; }
    </style>
  </head>
  <body>
    <header>
      <h1 id="title">Neural Board</h1>
      <button id="close">Close</button>
    </header>
    <iframe id="frame" class="idle" sandbox="allow-scripts" title="board"></iframe>
    <script>
      const frame = document.getElementById('frame');
      const title = document.getElementById('title');
      let socket;
      function connect() {
        socket = new WebSocket(`ws://${location.host}/ws`);
        socket.onmessage = (event) => {
          const msg = JSON.parse(event.data);
          if (msg.type === 'show') {
            title.textContent = msg.title || 'Neural Board';
            frame.srcdoc = msg.document;
            frame.classList.remove('idle');
          } else if (msg.type === 'hide') {
            title.textContent = 'Neural Board';
            frame.srcdoc = '';
            frame.classList.add('idle');
          }
        };
        socket.onclose = () => setTimeout(connect, 1000);
      }
      document.getElementById('close').onclick = () => {
        if (socket && socket.readyState === WebSocket.OPEN) {
          socket.send(JSON.stringify({ type: 'close' }));
        } else {
          fetch('/close', { method: 'POST' });
        }
      };
      connect();
    </script>
  </body>
</html>
"#;

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

/// Current content, or `null`
async fn get_content(State(board): State<SharedBoard>) -> impl IntoResponse {
    let content: Option<DisplayContent> = board.lock().await.current().cloned();
    Json(content)
}

/// Close signal over plain HTTP
async fn close(State(board): State<SharedBoard>) -> impl IntoResponse {
    board.lock().await.hide();
    StatusCode::NO_CONTENT
}

async fn ws_upgrade(State(board): State<SharedBoard>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, board))
}

/// Handle one renderer connection
async fn handle_socket(socket: axum::extract::ws::WebSocket, board: SharedBoard) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading the current content so no change slips between
    let (mut rx, initial) = {
        let guard = board.lock().await;
        let initial = guard
            .current()
            .map_or(BoardWsOutgoing::Hide, BoardWsOutgoing::show);
        (guard.subscribe(), initial)
    };

    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::channel::<BoardWsOutgoing>(8);

    tracing::info!("board renderer connected");

    let mut send_task = tokio::spawn(async move {
        if send_json(&mut sender, &initial).await.is_err() {
            return;
        }
        loop {
            let outgoing = tokio::select! {
                command = rx.recv() => match command {
                    Ok(command) => BoardWsOutgoing::from(command),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "board renderer lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                Some(reply) = reply_rx.recv() => reply,
            };
            if send_json(&mut sender, &outgoing).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str(text.as_str()) {
                    Ok(BoardWsIncoming::Close) => {
                        board.lock().await.hide();
                    }
                    Ok(BoardWsIncoming::Ping) => {
                        let _ = reply_tx.send(BoardWsOutgoing::Pong).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "board websocket message error"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::info!("board renderer disconnected");
}

async fn send_json<S>(sender: &mut S, message: &BoardWsOutgoing) -> crate::Result<()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = serde_json::to_string(message)?;
    sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|_| crate::Error::Transport("board renderer gone".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_document_wraps_markup() {
        let doc = frame_document("<h1>Core</h1>");
        assert!(doc.starts_with("<!DOCTYPE html>"));
        assert!(doc.contains("<h1>Core</h1>"));
        assert!(doc.contains("padding: 32px"));
        assert!(doc.contains("'Inter'"));
    }

    #[test]
    fn outgoing_show_carries_document() {
        let out = BoardWsOutgoing::from(BoardCommand::Show {
            content: DisplayContent {
                title: None,
                html: "<p>x</p>".to_string(),
            },
        });
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["type"], "show");
        assert!(json.get("title").is_none());
        assert!(json["document"].as_str().unwrap().contains("<p>x</p>"));
    }

    #[test]
    fn incoming_close_parses() {
        let msg: BoardWsIncoming = serde_json::from_str(r#"{"type":"close"}"#).unwrap();
        assert!(matches!(msg, BoardWsIncoming::Close));
    }

    #[test]
    fn index_page_sandboxes_frame() {
        assert!(INDEX_PAGE.contains(r#"sandbox="allow-scripts""#));
        assert!(!INDEX_PAGE.contains("allow-same-origin"));
    }
}
