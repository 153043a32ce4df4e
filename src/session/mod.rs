//! Session lifecycle: connection state machine, reconnection and tool calls

mod controller;
pub mod retry;
pub mod state;
pub mod tools;

pub use controller::{
    BRIDGE_FAILURE, CRITICAL_FAILURE, Command, ControllerConfig, LINK_DISTURBANCE, REBOOTING_LINK,
    SessionController,
};
pub use retry::{RetryDecision, RetryManager, RetryPolicy, delay_for_attempt};
pub use state::{AvatarState, ConnectionState, Snapshot, Speaker, Transcript};
pub use tools::{ToolRouter, declarations};
