//! Agent module - the conversational tool loop.
//!
//! The agent follows a "tools in a loop" pattern:
//! 1. Append the user message to the conversation history
//! 2. Send the system prompt and recent history to the model
//! 3. If the reply is a tool request, validate and run it, append the result
//! 4. Repeat until the model answers in prose or the tool-call cap is reached

mod agent_loop;
pub mod events;
pub mod history;
pub mod parser;
mod prompt;

pub use agent_loop::{Agent, AgentError, AgentState, StopReason, TurnOutcome};
pub use events::{channel, AgentEvent, EventReceiver, EventSender};
pub use history::{ConversationHistory, Message, MessageRole};
pub use parser::{parse_model_output, ParsedOutput, ToolInvocationRequest};
pub use prompt::build_system_prompt;
