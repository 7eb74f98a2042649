//! HTTP client for a remote inference server.
//!
//! The server exposes `GET /health`, `POST /chat` (role/content messages) and
//! `POST /generate` (a single flattened prompt). Streaming responses are
//! newline-delimited JSON, one fragment per line. Plain Ollama response shapes
//! are accepted too, so the client also works against `ollama serve`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ChatMessage, GenerationOptions, LlmClient, LlmError, ModelRequest};
use crate::config::Config;

/// Which endpoint the conversation is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendMode {
    /// `POST /chat` with the message list.
    #[default]
    Chat,
    /// `POST /generate` with the history flattened into one prompt.
    Generate,
}

impl FromStr for BackendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "generate" => Ok(Self::Generate),
            other => Err(format!("expected 'chat' or 'generate', got: {}", other)),
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Client for the remote inference server.
#[derive(Clone)]
pub struct RemoteLlmClient {
    client: reqwest::Client,
    base_url: String,
    mode: BackendMode,
    max_retries: u32,
}

impl RemoteLlmClient {
    pub fn new(config: &Config) -> Result<Self, LlmError> {
        let mut headers = HeaderMap::new();
        // Tunnels such as ngrok serve an HTML interstitial without this.
        headers.insert(
            "ngrok-skip-browser-warning",
            HeaderValue::from_static("true"),
        );

        // Per-read rather than total, so long streamed generations are not cut off.
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            mode: config.backend_mode,
            max_retries: config.max_retries,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check that the server is reachable.
    pub async fn health(&self) -> Result<HealthStatus, LlmError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<HealthStatus>()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))
    }

    /// One request/response exchange. Reports whether any fragment was
    /// delivered before a failure, since those attempts must not be retried.
    async fn attempt(
        &self,
        request: &ModelRequest,
        on_fragment: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<String, AttemptError> {
        let (url, body) = match self.mode {
            BackendMode::Chat => (
                format!("{}/chat", self.base_url),
                RequestBody::Chat {
                    messages: &request.messages,
                    stream: request.stream,
                    options: non_empty(&request.options),
                },
            ),
            BackendMode::Generate => (
                format!("{}/generate", self.base_url),
                RequestBody::Generate {
                    prompt: render_prompt(&request.messages),
                    stream: request.stream,
                    options: non_empty(&request.options),
                },
            ),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(AttemptError::before)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::before(LlmError::Status {
                status: status.as_u16(),
                body,
            }));
        }

        if !request.stream {
            let fragment: Fragment = response
                .json()
                .await
                .map_err(|e| AttemptError::before(LlmError::Decode(e.to_string())))?;
            if let Some(err) = fragment.error {
                return Err(AttemptError::before(LlmError::Backend(err)));
            }
            let text = fragment.text().to_string();
            if text.is_empty() {
                return Err(AttemptError::before(LlmError::EmptyResponse));
            }
            on_fragment(&text);
            return Ok(text);
        }

        let mut collector = FragmentCollector::default();
        let mut stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| collector.fail(e.into()))?;
            pending.extend_from_slice(&chunk);

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if collector.feed(&line, on_fragment)? {
                    break 'read;
                }
            }
        }
        if !pending.is_empty() && !collector.done {
            collector.feed(&pending, on_fragment)?;
        }

        if collector.text.is_empty() {
            return Err(AttemptError::before(LlmError::EmptyResponse));
        }
        Ok(collector.text)
    }
}

#[async_trait]
impl LlmClient for RemoteLlmClient {
    async fn complete(
        &self,
        request: &ModelRequest,
        on_fragment: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<String, LlmError> {
        let attempts = self.max_retries.max(1);
        info!(
            url = self.base_url.as_str(),
            messages = request.messages.len(),
            stream = request.stream,
            "Sending request to model backend"
        );

        let mut attempt = 1;
        loop {
            match self.attempt(request, on_fragment).await {
                Ok(text) => {
                    debug!(chars = text.len(), attempt, "Received model response");
                    return Ok(text);
                }
                Err(AttemptError { error, delivered }) => {
                    if delivered || attempt >= attempts {
                        warn!(attempt, error = %error, "Model request failed");
                        return Err(error);
                    }
                    warn!(attempt, attempts, error = %error, "Model request failed, retrying");
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                    attempt += 1;
                }
            }
        }
    }
}

struct AttemptError {
    error: LlmError,
    delivered: bool,
}

impl AttemptError {
    fn before(error: impl Into<LlmError>) -> Self {
        Self {
            error: error.into(),
            delivered: false,
        }
    }
}

/// Accumulates streamed NDJSON lines into the full response text.
#[derive(Default)]
struct FragmentCollector {
    text: String,
    done: bool,
}

impl FragmentCollector {
    fn fail(&self, error: LlmError) -> AttemptError {
        AttemptError {
            error,
            delivered: !self.text.is_empty(),
        }
    }

    /// Process one line. Returns true once the backend marks the response done.
    fn feed(
        &mut self,
        line: &[u8],
        on_fragment: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<bool, AttemptError> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return Ok(false);
        }

        let fragment: Fragment = serde_json::from_str(line)
            .map_err(|e| self.fail(LlmError::Decode(format!("{}: {}", e, line))))?;
        if let Some(err) = fragment.error {
            return Err(self.fail(LlmError::Backend(err)));
        }

        let piece = fragment.text();
        if !piece.is_empty() {
            self.text.push_str(piece);
            on_fragment(piece);
        }
        self.done = fragment.done;
        Ok(self.done)
    }
}

/// One response object, streamed or not. Covers both the relay server's
/// `{"content"}`/`{"response"}` shapes and Ollama's `{"message": {...}}`.
#[derive(Debug, Default, Deserialize)]
struct Fragment {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    message: Option<FragmentMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FragmentMessage {
    #[serde(default)]
    content: String,
}

impl Fragment {
    fn text(&self) -> &str {
        self.content
            .as_deref()
            .or(self.response.as_deref())
            .or(self.message.as_ref().map(|m| m.content.as_str()))
            .unwrap_or("")
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestBody<'a> {
    Chat {
        messages: &'a [ChatMessage],
        stream: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<&'a GenerationOptions>,
    },
    Generate {
        prompt: String,
        stream: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<&'a GenerationOptions>,
    },
}

fn non_empty(options: &GenerationOptions) -> Option<&GenerationOptions> {
    (!options.is_empty()).then_some(options)
}

/// Flatten messages into a single prompt for `/generate`.
pub(crate) fn render_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}\n", m.role.label(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    #[test]
    fn parses_backend_mode() {
        assert_eq!("chat".parse::<BackendMode>().unwrap(), BackendMode::Chat);
        assert_eq!(
            " Generate ".parse::<BackendMode>().unwrap(),
            BackendMode::Generate
        );
        assert!("stream".parse::<BackendMode>().is_err());
    }

    #[test]
    fn fragment_text_covers_all_shapes() {
        let relay_chat: Fragment = serde_json::from_str(r#"{"content": "a"}"#).unwrap();
        let relay_gen: Fragment = serde_json::from_str(r#"{"response": "b"}"#).unwrap();
        let ollama: Fragment =
            serde_json::from_str(r#"{"message": {"role": "assistant", "content": "c"}, "done": true}"#)
                .unwrap();
        assert_eq!(relay_chat.text(), "a");
        assert_eq!(relay_gen.text(), "b");
        assert_eq!(ollama.text(), "c");
        assert!(ollama.done);
    }

    #[test]
    fn collector_concatenates_in_order_and_stops_at_done() {
        let mut collector = FragmentCollector::default();
        let mut seen = Vec::new();
        let mut sink = |s: &str| seen.push(s.to_string());

        assert!(!collector.feed(b"{\"content\": \"Hel\"}\n", &mut sink).ok().unwrap());
        assert!(!collector.feed(b"\n", &mut sink).ok().unwrap());
        assert!(!collector.feed(b"{\"content\": \"lo\"}", &mut sink).ok().unwrap());
        assert!(collector
            .feed(b"{\"content\": \"\", \"done\": true}", &mut sink)
            .ok()
            .unwrap());

        assert_eq!(collector.text, "Hello");
        assert_eq!(seen, vec!["Hel", "lo"]);
    }

    #[test]
    fn collector_error_after_text_is_marked_delivered() {
        let mut collector = FragmentCollector::default();
        let mut sink = |_: &str| {};
        collector.feed(b"{\"content\": \"x\"}", &mut sink).ok().unwrap();

        let err = collector
            .feed(b"{\"error\": \"model crashed\"}", &mut sink)
            .err()
            .unwrap();
        assert!(err.delivered);
        assert!(matches!(err.error, LlmError::Backend(ref m) if m == "model crashed"));
    }

    #[test]
    fn prompt_flattens_roles() {
        let prompt = render_prompt(&[
            ChatMessage::system("be brief"),
            ChatMessage::new(Role::User, "hi"),
        ]);
        assert_eq!(prompt, "System: be brief\n\nUser: hi\n");
    }
}
