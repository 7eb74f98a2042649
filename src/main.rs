//! Coder Agent - Interactive Entry Point
//!
//! Connects to the inference server and runs the read-eval-print loop.

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use coder_agent::agent::{self, Agent, AgentEvent, AgentState, EventReceiver, StopReason};
use coder_agent::config::Config;
use coder_agent::llm::{BackendMode, LlmError, RemoteLlmClient};

const RESULT_PREVIEW_CHARS: usize = 150;

#[derive(Parser, Debug)]
#[command(
    name = "coder-agent",
    version,
    about = "Coding agent that drives a remote model through workspace tools"
)]
struct Cli {
    /// Inference server URL (overrides CODER_BACKEND_URL)
    endpoint: Option<String>,

    /// Workspace directory tools are confined to
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Backend endpoint to talk to: chat or generate
    #[arg(long, value_parser = BackendMode::from_str)]
    mode: Option<BackendMode>,

    /// Tool calls allowed per message
    #[arg(long)]
    max_tool_calls: Option<usize>,

    /// Wait for complete responses instead of streaming
    #[arg(long)]
    no_stream: bool,

    /// Debug logging and full tool results
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they do not interleave with the streamed reply
    let default_filter = if cli.verbose {
        "coder_agent=debug"
    } else {
        "coder_agent=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = apply_overrides(Config::from_env()?, &cli)?;
    info!(
        backend = config.backend_url.as_str(),
        mode = ?config.backend_mode,
        workspace = %config.workspace_path.display(),
        "Loaded configuration"
    );

    let llm = Arc::new(RemoteLlmClient::new(&config).context("building HTTP client")?);
    check_health(&llm).await?;

    let (tx, mut events) = agent::channel();
    let mut agent = Agent::new(config, llm)?.with_events(tx);

    println!("Workspace: {}", agent.tools().sandbox().root().display());
    println!("Commands: 'reset' clears the conversation, 'verbose' toggles tool output, 'exit' quits.");

    repl(&mut agent, &mut events, cli.verbose).await
}

fn apply_overrides(mut config: Config, cli: &Cli) -> anyhow::Result<Config> {
    if let Some(endpoint) = &cli.endpoint {
        config = config.with_endpoint(endpoint)?;
    }
    if let Some(workspace) = &cli.workspace {
        config.workspace_path = workspace.clone();
    }
    if let Some(mode) = cli.mode {
        config.backend_mode = mode;
    }
    if let Some(max) = cli.max_tool_calls {
        config.max_tool_calls = max;
    }
    if cli.no_stream {
        config.stream = false;
    }
    Ok(config)
}

/// An unreachable server is fatal. A server that answers oddly only warns,
/// since some proxies do not implement `/health`.
async fn check_health(llm: &RemoteLlmClient) -> anyhow::Result<()> {
    match llm.health().await {
        Ok(health) => {
            println!(
                "Connected to {} (status: {}, model: {})",
                llm.base_url(),
                health.status,
                health.model.as_deref().unwrap_or("unknown")
            );
            Ok(())
        }
        Err(LlmError::Transport(e)) => {
            bail!("Cannot reach inference server at {}: {}", llm.base_url(), e)
        }
        Err(e) => {
            warn!(error = %e, "Health check failed, continuing anyway");
            Ok(())
        }
    }
}

async fn repl(
    agent: &mut Agent,
    events: &mut EventReceiver,
    verbose: bool,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printer = EventPrinter { verbose };

    loop {
        print!("\nYou: ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted. Type 'exit' to quit.");
                continue;
            }
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let input = line.trim();
        match input {
            "" => continue,
            "exit" | "quit" | "q" => break,
            "reset" => {
                agent.reset();
                println!("Conversation reset.");
                continue;
            }
            "verbose" => {
                printer.verbose = !printer.verbose;
                println!(
                    "Verbose tool output {}.",
                    if printer.verbose { "on" } else { "off" }
                );
                continue;
            }
            _ => {}
        }

        let cancel = CancellationToken::new();
        let outcome = {
            let turn = agent.run_turn(input, &cancel);
            tokio::pin!(turn);
            loop {
                tokio::select! {
                    outcome = &mut turn => break outcome,
                    Some(event) = events.recv() => printer.show(event),
                    _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => cancel.cancel(),
                }
            }
        };
        while let Ok(event) = events.try_recv() {
            printer.show(event);
        }

        match outcome {
            Ok(outcome) => match outcome.stop {
                StopReason::Answered => println!(),
                StopReason::IterationCap => println!("\n{}", outcome.reply),
                StopReason::Cancelled => println!("\n[Cancelled]"),
            },
            Err(e) => println!("\nError: {}", e),
        }
    }

    println!("Goodbye!");
    Ok(())
}

struct EventPrinter {
    verbose: bool,
}

impl EventPrinter {
    fn show(&self, event: AgentEvent) {
        match event {
            AgentEvent::StateChanged {
                state: AgentState::CallingModel,
            } => print!("\nAssistant: "),
            AgentEvent::TextDelta { content } => print!("{}", content),
            AgentEvent::ToolCall { name, .. } => println!("\n[Executing: {}]", name),
            AgentEvent::ToolResult { result, .. } => {
                let text = result.render();
                if self.verbose {
                    println!("[Result: {}]", text);
                } else {
                    println!("[Result: {}]", preview(&text));
                }
            }
            _ => {}
        }
        let _ = std::io::stdout().flush();
    }
}

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(RESULT_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
