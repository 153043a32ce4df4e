//! Tool-call router: board side effects for remote function calls

use serde_json::json;

use crate::canvas::{DisplayContent, SharedBoard};
use crate::live::{FunctionCall, FunctionDeclaration, FunctionResponse};
use crate::{Error, Result};

/// Show markup on the board
pub const DISPLAY_CONTENT: &str = "display_content";

/// Clear the board
pub const HIDE_CONTENT: &str = "hide_content";

/// Result sent back after showing content
pub const ENGAGED: &str = "Engaged.";

/// Result sent back after hiding content
pub const DISENGAGED: &str = "Disengaged.";

/// Tools declared to the session at connect time
#[must_use]
pub fn declarations() -> Vec<FunctionDeclaration> {
    vec![
        FunctionDeclaration {
            name: DISPLAY_CONTENT.to_string(),
            description: "CRITICAL: Use this tool for ALL code, technical data, or visual \
                explanations on the Neural Board. DO NOT use Markdown code blocks. The board is \
                a holographic sandbox for HTML/CSS/JS. Ensure visuals are clean and responsive."
                .to_string(),
            parameters: Some(json!({
                "type": "OBJECT",
                "properties": {
                    "title": {
                        "type": "STRING",
                        "description": "Descriptive title for the frame."
                    },
                    "html": {
                        "type": "STRING",
                        "description": "Full self-contained HTML/CSS/JS source code."
                    }
                },
                "required": ["html"]
            })),
        },
        FunctionDeclaration {
            name: HIDE_CONTENT.to_string(),
            description: "Closes the holographic board.".to_string(),
            parameters: None,
        },
    ]
}

/// Applies function calls to the board
#[derive(Debug, Clone)]
pub struct ToolRouter {
    board: SharedBoard,
}

impl ToolRouter {
    #[must_use]
    pub const fn new(board: SharedBoard) -> Self {
        Self { board }
    }

    /// Run one call and build its acknowledgement
    ///
    /// # Errors
    ///
    /// Returns `Error::ToolCall` for an unrecognized tool name; no
    /// acknowledgement is owed in that case.
    pub async fn dispatch(&self, call: &FunctionCall) -> Result<FunctionResponse> {
        match call.name.as_str() {
            DISPLAY_CONTENT => {
                // A call without html still replaces the board
                let content = DisplayContent {
                    title: call.str_arg("title").map(str::to_string),
                    html: call.str_arg("html").unwrap_or_default().to_string(),
                };
                tracing::debug!(id = %call.id, title = ?content.title, "board content shown");
                self.board.lock().await.show(content);
                Ok(FunctionResponse::result(&call.id, &call.name, ENGAGED))
            }
            HIDE_CONTENT => {
                self.board.lock().await.hide();
                tracing::debug!(id = %call.id, "board content hidden");
                Ok(FunctionResponse::result(&call.id, &call.name, DISENGAGED))
            }
            other => Err(Error::ToolCall(other.to_string())),
        }
    }

    /// Whether the board currently shows content
    pub async fn board_visible(&self) -> bool {
        self.board.lock().await.is_visible()
    }
}
