//! Core agent loop implementation.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::llm::{ChatMessage, LlmClient, LlmError, ModelRequest};
use crate::tools::{Sandbox, ToolError, ToolLimits, ToolRegistry, ToolResult};

use super::events::{AgentEvent, EventSender};
use super::history::{ConversationHistory, Message};
use super::parser::{parse_model_output, ParsedOutput, ToolInvocationRequest};
use super::prompt::build_system_prompt;

/// Where the agent is within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    AwaitingUserInput,
    CallingModel,
    ParsingOutput,
    ExecutingTool,
    Done,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Could not open workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Model backend unavailable: {0}")]
    BackendUnavailable(#[source] LlmError),
}

/// Why a turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model gave a final answer.
    Answered,
    /// The model kept requesting tools past `max_tool_calls`.
    IterationCap,
    /// The caller cancelled the turn. History is unchanged.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Final answer, or a diagnostic when the turn did not produce one.
    pub reply: String,
    pub stop: StopReason,
    /// Tool requests handled this turn, malformed ones included.
    pub tool_calls: usize,
}

/// A single conversational coding agent bound to one workspace.
pub struct Agent {
    id: Uuid,
    config: Config,
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    history: ConversationHistory,
    state: AgentState,
    system_prompt: String,
    events: Option<EventSender>,
}

impl Agent {
    /// Create an agent. The workspace directory is created if missing.
    pub fn new(config: Config, llm: Arc<dyn LlmClient>) -> Result<Self, AgentError> {
        let sandbox =
            Sandbox::new(&config.workspace_path).map_err(|source| AgentError::Workspace {
                path: config.workspace_path.clone(),
                source,
            })?;
        let tools = ToolRegistry::new(sandbox, ToolLimits::from_config(&config));
        let system_prompt =
            build_system_prompt(&tools.sandbox().root().to_string_lossy(), &tools);

        Ok(Self {
            id: Uuid::new_v4(),
            config,
            llm,
            tools,
            history: ConversationHistory::new(),
            state: AgentState::AwaitingUserInput,
            system_prompt,
            events: None,
        })
    }

    /// Report progress on `sender` while turns run.
    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Forget the conversation.
    pub fn reset(&mut self) {
        self.history.clear();
        self.set_state(AgentState::AwaitingUserInput);
        info!(session = %self.id, "Conversation reset");
    }

    /// Handle one user message until the model answers, the tool-call cap is
    /// hit, or `cancel` fires.
    ///
    /// # Errors
    ///
    /// `AgentError::BackendUnavailable` if the model could not be reached. The
    /// history built up so far in the turn is kept.
    pub async fn run_turn(
        &mut self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let checkpoint = self.history.len();
        let span = tracing::info_span!("turn", session = %self.id);

        match self.drive(input, cancel).instrument(span).await {
            Ok(outcome) if outcome.stop == StopReason::Cancelled => {
                self.history.rollback(checkpoint);
                self.set_state(AgentState::AwaitingUserInput);
                info!(session = %self.id, "Turn cancelled");
                Ok(outcome)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(session = %self.id, error = %e, "Turn failed");
                self.emit(AgentEvent::Error {
                    message: e.to_string(),
                });
                self.set_state(AgentState::AwaitingUserInput);
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let cap = self.config.max_tool_calls;
        let mut tool_calls = 0;

        self.history.push(Message::user(input));

        loop {
            self.set_state(AgentState::CallingModel);
            let request = self.build_request();
            debug!(
                iteration = tool_calls + 1,
                messages = request.messages.len(),
                "Calling model"
            );

            let llm = Arc::clone(&self.llm);
            let events = self.events.clone();
            let mut on_fragment = move |fragment: &str| {
                if let Some(tx) = &events {
                    let _ = tx.send(AgentEvent::TextDelta {
                        content: fragment.to_string(),
                    });
                }
            };

            let response = match or_cancel(cancel, llm.complete(&request, &mut on_fragment)).await
            {
                Some(Ok(text)) => text,
                Some(Err(e)) => return Err(AgentError::BackendUnavailable(e)),
                None => return Ok(cancelled(tool_calls)),
            };

            self.set_state(AgentState::ParsingOutput);
            let request = match parse_model_output(&response) {
                ParsedOutput::FinalAnswer(answer) => {
                    self.history.push(Message::assistant(response));
                    self.set_state(AgentState::Done);
                    info!(tool_calls, "Turn answered");
                    return Ok(TurnOutcome {
                        reply: answer,
                        stop: StopReason::Answered,
                        tool_calls,
                    });
                }
                ParsedOutput::ToolRequest(request) => Ok(request),
                ParsedOutput::Malformed { tool_name, reason } => Err((tool_name, reason)),
            };

            tool_calls += 1;
            if tool_calls > cap {
                self.history.push(Message::assistant(response));
                self.set_state(AgentState::Done);
                warn!(limit = cap, "Tool call cap reached");
                self.emit(AgentEvent::IterationCap { limit: cap });
                return Ok(TurnOutcome {
                    reply: cap_diagnostic(cap),
                    stop: StopReason::IterationCap,
                    tool_calls: cap,
                });
            }

            self.set_state(AgentState::ExecutingTool);
            let (tool_name, result) = match request {
                Ok(request) => match or_cancel(cancel, self.execute_request(request)).await {
                    Some(done) => done,
                    None => return Ok(cancelled(tool_calls)),
                },
                Err((tool_name, reason)) => {
                    debug!(reason = reason.as_str(), "Malformed tool request");
                    let err =
                        ToolError::invalid(tool_name.as_deref().unwrap_or("request"), reason);
                    (tool_name, ToolResult::failure(&err))
                }
            };

            self.history.push(Message::assistant(response));
            self.history
                .push(Message::tool_result(tool_name.as_deref(), &result));
            self.emit(AgentEvent::ToolResult {
                name: tool_name,
                result,
            });
        }
    }

    /// Resolve and run a tool request. Unknown tools become a failed result.
    async fn execute_request(
        &self,
        request: ToolInvocationRequest,
    ) -> (Option<String>, ToolResult) {
        let definition = match self.tools.resolve(&request.tool_name) {
            Ok(def) => def,
            Err(e) => {
                debug!(tool = request.tool_name.as_str(), "Unknown tool requested");
                return (Some(request.tool_name), ToolResult::failure(&e));
            }
        };

        info!(tool = definition.name, "Executing tool");
        self.emit(AgentEvent::ToolCall {
            name: definition.name.to_string(),
            args: request.arguments.clone(),
        });
        let result = self.tools.execute(definition, &request.arguments).await;
        (Some(definition.name.to_string()), result)
    }

    fn build_request(&self) -> ModelRequest {
        let (omitted, window) = self.history.window(self.config.history_window);

        let mut messages = Vec::with_capacity(window.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        if omitted > 0 {
            messages.push(ChatMessage::system(format!(
                "[{} earlier messages truncated]",
                omitted
            )));
        }
        messages.extend(window.iter().map(Message::to_wire));

        ModelRequest {
            messages,
            options: self.config.generation.clone(),
            stream: self.config.stream,
        }
    }

    fn set_state(&mut self, state: AgentState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "State change");
            self.state = state;
            self.emit(AgentEvent::StateChanged { state });
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Await `fut` unless `cancel` fires first.
async fn or_cancel<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

fn cancelled(tool_calls: usize) -> TurnOutcome {
    TurnOutcome {
        reply: String::new(),
        stop: StopReason::Cancelled,
        tool_calls,
    }
}

fn cap_diagnostic(cap: usize) -> String {
    format!(
        "Stopped after {} tool calls without a final answer. \
         Try rephrasing the request or type 'reset' to start over.",
        cap
    )
}
