//! Tool registry and the fixed set of tools the model may invoke.
//!
//! Every request goes through three steps:
//! 1. [`ToolRegistry::resolve`] looks the name up among the fixed definitions
//! 2. [`ToolRegistry::validate`] turns the raw argument map into a typed [`ToolInvocation`]
//! 3. the matching executor runs with paths confined to the [`Sandbox`]
//!
//! Failures at any step come back as a failed [`ToolResult`], never as a panic
//! or an error that aborts the agent loop.

mod files;
mod sandbox;
mod search;
mod terminal;

pub use sandbox::Sandbox;

use std::io;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::config::Config;

/// Tool-level failures. All of these are recovered into a [`ToolResult`].
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Access denied: {0} is outside the workspace")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Command timed out after {0} seconds")]
    ExecutionTimeout(u64),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    pub(crate) fn invalid(tool: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }

    /// Map an I/O error on `path`, folding `NotFound` into the taxonomy.
    pub(crate) fn io(path: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound(path.to_string())
        } else {
            Self::Io {
                path: path.to_string(),
                source,
            }
        }
    }
}

/// Outcome of one tool execution, fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(err: &ToolError) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(err.to_string()),
        }
    }

    /// Text shown to the model in the tool_result message.
    pub fn render(&self) -> String {
        match &self.error {
            Some(err) if self.output.is_empty() => format!("Error: {}", err),
            Some(err) => format!("{}\nError: {}", self.output, err),
            None => self.output.clone(),
        }
    }
}

/// The executor a definition is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    ReadFile,
    WriteFile,
    ListDirectory,
    ExecuteBash,
    SearchCode,
}

/// Static description of a tool: name, schema, and which executor runs it.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    pub kind: ToolKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadFileArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListDirectoryArgs {
    #[serde(default = "default_path")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecuteBashArgs {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchCodeArgs {
    pub pattern: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub file_pattern: Option<String>,
}

fn default_path() -> String {
    ".".to_string()
}

/// A validated request, one variant per tool kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocation {
    ReadFile(ReadFileArgs),
    WriteFile(WriteFileArgs),
    ListDirectory(ListDirectoryArgs),
    ExecuteBash(ExecuteBashArgs),
    SearchCode(SearchCodeArgs),
}

/// Limits applied by the executors.
#[derive(Debug, Clone)]
pub struct ToolLimits {
    pub command_timeout: Duration,
    pub output_limit_bytes: usize,
    pub search_max_matches: usize,
}

impl ToolLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            search_max_matches: config.search_max_matches,
        }
    }
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            output_limit_bytes: 10_000,
            search_max_matches: 100,
        }
    }
}

/// Registry of the fixed tool set.
pub struct ToolRegistry {
    definitions: Vec<ToolDefinition>,
    sandbox: Sandbox,
    limits: ToolLimits,
}

impl ToolRegistry {
    pub fn new(sandbox: Sandbox, limits: ToolLimits) -> Self {
        Self {
            definitions: builtin_definitions(),
            sandbox,
            limits,
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// All definitions, in the order they are presented to the model.
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    /// Look up a definition by exact name.
    pub fn resolve(&self, name: &str) -> Result<&ToolDefinition, ToolError> {
        self.definitions
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    /// Check the raw arguments against the definition's schema.
    pub fn validate(
        &self,
        definition: &ToolDefinition,
        arguments: &Map<String, Value>,
    ) -> Result<ToolInvocation, ToolError> {
        let name = definition.name;
        Ok(match definition.kind {
            ToolKind::ReadFile => ToolInvocation::ReadFile(parse_args(name, arguments)?),
            ToolKind::WriteFile => ToolInvocation::WriteFile(parse_args(name, arguments)?),
            ToolKind::ListDirectory => {
                ToolInvocation::ListDirectory(parse_args(name, arguments)?)
            }
            ToolKind::ExecuteBash => {
                let args: ExecuteBashArgs = parse_args(name, arguments)?;
                if args.command.trim().is_empty() {
                    return Err(ToolError::invalid(name, "command must not be empty"));
                }
                ToolInvocation::ExecuteBash(args)
            }
            ToolKind::SearchCode => {
                let args: SearchCodeArgs = parse_args(name, arguments)?;
                if args.pattern.is_empty() {
                    return Err(ToolError::invalid(name, "pattern must not be empty"));
                }
                ToolInvocation::SearchCode(args)
            }
        })
    }

    /// Validate and run a tool. Never fails: errors become a failed result.
    pub async fn execute(
        &self,
        definition: &ToolDefinition,
        arguments: &Map<String, Value>,
    ) -> ToolResult {
        let outcome = match self.validate(definition, arguments) {
            Ok(invocation) => self.run(invocation).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(tool = definition.name, error = %e, "tool failed");
                ToolResult::failure(&e)
            }
        }
    }

    async fn run(&self, invocation: ToolInvocation) -> Result<ToolResult, ToolError> {
        let sandbox = &self.sandbox;
        let output = match invocation {
            ToolInvocation::ReadFile(args) => files::read_file(sandbox, &args).await?,
            ToolInvocation::WriteFile(args) => files::write_file(sandbox, &args).await?,
            ToolInvocation::ListDirectory(args) => {
                files::list_directory(sandbox, &args).await?.render()
            }
            ToolInvocation::ExecuteBash(args) => {
                terminal::execute_bash(sandbox, &args, &self.limits)
                    .await?
                    .render()
            }
            ToolInvocation::SearchCode(args) => {
                search::search_code(sandbox, &args, self.limits.search_max_matches)
                    .await?
                    .render()
            }
        };
        Ok(ToolResult::ok(output))
    }
}

fn parse_args<T: DeserializeOwned>(
    tool: &str,
    arguments: &Map<String, Value>,
) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(arguments.clone()))
        .map_err(|e| ToolError::invalid(tool, e.to_string()))
}

fn builtin_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "read_file",
            description: "Read a text file from the workspace and return its contents.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path, relative to the workspace"
                    }
                },
                "required": ["path"]
            }),
            kind: ToolKind::ReadFile,
        },
        ToolDefinition {
            name: "write_file",
            description: "Create or overwrite a file with the given content. Parent directories are created as needed.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path, relative to the workspace"
                    },
                    "content": {
                        "type": "string",
                        "description": "Complete file content"
                    }
                },
                "required": ["path", "content"]
            }),
            kind: ToolKind::WriteFile,
        },
        ToolDefinition {
            name: "list_directory",
            description: "List the entries of a directory, sorted by name. Directories end with '/'.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory path, relative to the workspace (default: '.')"
                    }
                }
            }),
            kind: ToolKind::ListDirectory,
        },
        ToolDefinition {
            name: "execute_bash",
            description: "Run a shell command in the workspace directory. Returns the exit code and captured stdout/stderr.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute"
                    }
                },
                "required": ["command"]
            }),
            kind: ToolKind::ExecuteBash,
        },
        ToolDefinition {
            name: "search_code",
            description: "Search text files recursively for lines matching a regex. Returns file:line: text matches.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": {
                        "type": "string",
                        "description": "Regex to search for (matched literally if it is not a valid regex)"
                    },
                    "path": {
                        "type": "string",
                        "description": "Directory to search, relative to the workspace (default: '.')"
                    },
                    "file_pattern": {
                        "type": "string",
                        "description": "Optional glob on file names, e.g. '*.py'"
                    }
                },
                "required": ["pattern"]
            }),
            kind: ToolKind::SearchCode,
        },
    ]
}
