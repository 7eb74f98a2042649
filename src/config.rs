//! Configuration management for coder-agent.
//!
//! Configuration can be set via environment variables:
//! - `CODER_BACKEND_URL` - Optional. Inference server base URL. Defaults to `http://127.0.0.1:5000`.
//! - `CODER_BACKEND_MODE` - Optional. `chat` or `generate`. Defaults to `chat`.
//! - `CODER_WORKSPACE` - Optional. The workspace root tools are confined to. Defaults to current directory.
//! - `CODER_MAX_TOOL_CALLS` - Optional. Tool calls allowed per user turn. Defaults to `5`.
//! - `CODER_REQUEST_TIMEOUT_SECS` - Optional. Model request timeout. Defaults to `120`.
//! - `CODER_MAX_RETRIES` - Optional. Attempts per model request. Defaults to `2`.
//! - `CODER_COMMAND_TIMEOUT_SECS` - Optional. `execute_bash` timeout. Defaults to `30`.
//! - `CODER_OUTPUT_LIMIT_BYTES` - Optional. Captured bytes per command stream. Defaults to `10000`.
//! - `CODER_SEARCH_MAX_MATCHES` - Optional. `search_code` result cap. Defaults to `100`.
//! - `CODER_HISTORY_WINDOW` - Optional. Messages sent per request, `0` for all. Defaults to `12`.
//! - `CODER_STREAM` - Optional. Stream model output. Defaults to `true`.
//! - `CODER_TEMPERATURE` - Optional. Sampling temperature.
//! - `CODER_MAX_TOKENS` - Optional. Maximum tokens to generate.
//!
//! Command-line flags override these.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::llm::{BackendMode, GenerationOptions};

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:5000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Invalid backend endpoint {0}: {1}")]
    InvalidEndpoint(String, String),
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Inference server base URL, without trailing slash
    pub backend_url: String,

    /// Which endpoint the conversation is sent to
    pub backend_mode: BackendMode,

    /// Workspace directory all tool paths are confined to
    pub workspace_path: PathBuf,

    /// Maximum tool calls within one user turn
    pub max_tool_calls: usize,

    pub request_timeout_secs: u64,

    /// Attempts per model request before giving up
    pub max_retries: u32,

    pub command_timeout_secs: u64,

    /// Cap on captured stdout/stderr bytes, each
    pub output_limit_bytes: usize,

    pub search_max_matches: usize,

    /// Most recent messages sent per request (0 = all)
    pub history_window: usize,

    /// Request streamed responses
    pub stream: bool,

    pub generation: GenerationOptions,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let workspace_path = lookup("CODER_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let backend_url =
            lookup("CODER_BACKEND_URL").unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());

        let stream = lookup("CODER_STREAM")
            .map(|v| {
                parse_bool(&v).map_err(|e| ConfigError::InvalidValue("CODER_STREAM".to_string(), e))
            })
            .transpose()?
            .unwrap_or(true);

        let generation = GenerationOptions {
            max_tokens: parse_optional(&lookup, "CODER_MAX_TOKENS")?,
            temperature: parse_optional(&lookup, "CODER_TEMPERATURE")?,
        };

        let config = Self {
            backend_url: String::new(),
            backend_mode: parse_or(&lookup, "CODER_BACKEND_MODE", BackendMode::Chat)?,
            workspace_path,
            max_tool_calls: parse_or(&lookup, "CODER_MAX_TOOL_CALLS", 5)?,
            request_timeout_secs: parse_or(&lookup, "CODER_REQUEST_TIMEOUT_SECS", 120)?,
            max_retries: parse_or(&lookup, "CODER_MAX_RETRIES", 2)?,
            command_timeout_secs: parse_or(&lookup, "CODER_COMMAND_TIMEOUT_SECS", 30)?,
            output_limit_bytes: parse_or(&lookup, "CODER_OUTPUT_LIMIT_BYTES", 10_000)?,
            search_max_matches: parse_or(&lookup, "CODER_SEARCH_MAX_MATCHES", 100)?,
            history_window: parse_or(&lookup, "CODER_HISTORY_WINDOW", 12)?,
            stream,
            generation,
        };

        config.with_endpoint(&backend_url)
    }

    /// Create a config with default limits (useful for testing).
    pub fn new(backend_url: String, workspace_path: PathBuf) -> Self {
        Self {
            backend_url,
            backend_mode: BackendMode::Chat,
            workspace_path,
            max_tool_calls: 5,
            request_timeout_secs: 120,
            max_retries: 2,
            command_timeout_secs: 30,
            output_limit_bytes: 10_000,
            search_max_matches: 100,
            history_window: 12,
            stream: true,
            generation: GenerationOptions::default(),
        }
    }

    /// Set the backend endpoint after checking it is an http(s) URL.
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self, ConfigError> {
        let parsed = url::Url::parse(endpoint.trim())
            .map_err(|e| ConfigError::InvalidEndpoint(endpoint.to_string(), e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEndpoint(
                endpoint.to_string(),
                format!("unsupported scheme {}", parsed.scheme()),
            ));
        }

        self.backend_url = parsed.as_str().trim_end_matches('/').to_string();
        Ok(self)
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_optional(lookup, key)?.unwrap_or(default))
}

fn parse_optional<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue(key.to_string(), format!("{}", e)))
        })
        .transpose()
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
        other => Err(format!("expected boolean-like value, got: {}", other)),
    }
}
