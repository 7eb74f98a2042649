//! # Coder Agent
//!
//! A conversational coding agent that drives a remote language model through
//! a small, fixed set of workspace tools.
//!
//! This library provides:
//! - A tool-based agent loop with a per-turn tool-call cap and cancellation
//! - Sandboxed file, shell and search tools confined to one workspace
//! - An HTTP client for chat/generate inference servers with NDJSON streaming
//!
//! ## Architecture
//!
//! The agent follows the "tools in a loop" pattern:
//! 1. Receive a message from the user
//! 2. Send the system prompt and conversation history to the model
//! 3. Parse the reply, execute a requested tool call
//! 4. Feed the result back to the model, repeat until it answers
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use coder_agent::{agent::Agent, config::Config, llm::RemoteLlmClient};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::from_env()?;
//! let llm = Arc::new(RemoteLlmClient::new(&config)?);
//! let mut agent = Agent::new(config, llm)?;
//! let outcome = agent.run_turn("List the files", &CancellationToken::new()).await?;
//! println!("{}", outcome.reply);
//! ```

pub mod agent;
pub mod config;
pub mod llm;
pub mod tools;

pub use config::Config;
