//! Local HTTP surface for the board renderer

pub mod board;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::canvas::SharedBoard;

/// Board server builder
#[derive(Debug, Clone)]
pub struct BoardServer {
    board: SharedBoard,
    port: u16,
}

impl BoardServer {
    #[must_use]
    pub const fn new(board: SharedBoard, port: u16) -> Self {
        Self { board, port }
    }

    /// Build the router with CORS and request tracing
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        board::router(self.board.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on localhost until the task is dropped
    ///
    /// # Errors
    ///
    /// Returns error if the server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind board server: {e}")))?;

        tracing::info!(url = %format!("http://{addr}/"), "board server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("board server error: {e}")))?;

        Ok(())
    }

    /// Run the server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
