//! Classifies raw model output as a final answer or a tool request.
//!
//! A tool request is a JSON object `{"tool": "<name>", "arguments": {...}}`
//! that is either the entire response or the body of exactly one fenced code
//! block. Anything else is prose and ends the turn.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

/// A tool call requested by the model, not yet validated.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocationRequest {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedOutput {
    /// Plain natural-language answer.
    FinalAnswer(String),
    /// A structurally valid tool request.
    ToolRequest(ToolInvocationRequest),
    /// Looked like a tool request but could not be used as one.
    Malformed {
        tool_name: Option<String>,
        reason: String,
    },
}

fn fenced_block() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n(.*?)```").expect("fence regex is valid")
    })
}

/// Parse a complete model response.
pub fn parse_model_output(text: &str) -> ParsedOutput {
    let trimmed = text.trim();

    if let Some(object) = tool_object(trimmed) {
        return interpret(object);
    }

    let mut blocks: Vec<Map<String, Value>> = fenced_block()
        .captures_iter(trimmed)
        .filter_map(|caps| caps.get(1))
        .filter_map(|body| tool_object(body.as_str().trim()))
        .collect();

    match blocks.len() {
        0 => ParsedOutput::FinalAnswer(trimmed.to_string()),
        1 => interpret(blocks.remove(0)),
        n => ParsedOutput::Malformed {
            tool_name: None,
            reason: format!(
                "found {} tool requests in one response; send exactly one at a time",
                n
            ),
        },
    }
}

/// A JSON object carrying a `tool` key, if `candidate` is one.
fn tool_object(candidate: &str) -> Option<Map<String, Value>> {
    if !candidate.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) if map.contains_key("tool") => Some(map),
        _ => None,
    }
}

fn interpret(mut object: Map<String, Value>) -> ParsedOutput {
    let tool_name = match object.remove("tool") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        _ => {
            return ParsedOutput::Malformed {
                tool_name: None,
                reason: "\"tool\" must be a string naming one tool".to_string(),
            }
        }
    };

    let arguments = object
        .remove("arguments")
        .or_else(|| object.remove("parameters"));
    let arguments = match arguments {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return ParsedOutput::Malformed {
                tool_name: Some(tool_name),
                reason: "\"arguments\" must be a JSON object".to_string(),
            }
        }
    };

    ParsedOutput::ToolRequest(ToolInvocationRequest {
        tool_name,
        arguments,
    })
}
