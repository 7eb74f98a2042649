//! Conversation history owned by one agent session.

use serde::Serialize;

use crate::llm::{ChatMessage, Role};
use crate::tools::ToolResult;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    ToolResult,
}

/// A single history entry. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_name: None,
            tool_output: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_name: None,
            tool_output: None,
        }
    }

    /// Result of a tool call, rendered for the model.
    pub fn tool_result(tool_name: Option<&str>, result: &ToolResult) -> Self {
        let label = tool_name.unwrap_or("invalid request");
        let status = if result.success { "ok" } else { "failed" };
        Self {
            role: MessageRole::ToolResult,
            content: format!("Tool result ({}, {}):\n{}", label, status, result.render()),
            tool_name: tool_name.map(str::to_string),
            tool_output: Some(result.output.clone()),
        }
    }

    /// Wire form. Backends only know system/user/assistant, so tool results
    /// travel as user messages; their content already names the tool.
    pub fn to_wire(&self) -> ChatMessage {
        let role = match self.role {
            MessageRole::User | MessageRole::ToolResult => Role::User,
            MessageRole::Assistant => Role::Assistant,
        };
        ChatMessage::new(role, self.content.clone())
    }
}

/// Ordered, append-only message log.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        debug_assert!(
            message.role != MessageRole::ToolResult
                || self.last().map(|m| m.role) == Some(MessageRole::Assistant),
            "tool_result must follow the assistant message that requested it"
        );
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Drop everything appended after `len`. Only used to undo a cancelled turn.
    pub(crate) fn rollback(&mut self, len: usize) {
        self.messages.truncate(len);
    }

    /// The most recent `limit` messages plus how many earlier ones were left
    /// out. `limit == 0` means no limit. The window is widened rather than
    /// start on a tool result whose request was cut off.
    pub fn window(&self, limit: usize) -> (usize, &[Message]) {
        if limit == 0 || self.messages.len() <= limit {
            return (0, &self.messages);
        }

        let mut start = self.messages.len() - limit;
        while start > 0 && self.messages[start].role == MessageRole::ToolResult {
            start -= 1;
        }
        (start, &self.messages[start..])
    }
}
