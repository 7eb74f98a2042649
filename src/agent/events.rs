use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::AgentState;
use crate::tools::ToolResult;

/// Progress events emitted while a turn runs.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The loop moved to a new state.
    StateChanged { state: AgentState },
    /// A piece of model output as it streams in.
    TextDelta { content: String },
    /// A validated-by-name tool is about to run.
    ToolCall {
        name: String,
        args: Map<String, Value>,
    },
    /// A tool request finished, or was rejected before running.
    ToolResult {
        name: Option<String>,
        result: ToolResult,
    },
    /// The turn hit the tool-call cap.
    IterationCap { limit: usize },
    /// The model backend failed.
    Error { message: String },
}

pub type EventSender = mpsc::UnboundedSender<AgentEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AgentEvent>;

/// Channel pair for [`crate::agent::Agent::with_events`].
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
