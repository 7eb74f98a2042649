//! `RemoteLlmClient` against a fake inference server over real HTTP.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use coder_agent::agent::{Agent, StopReason};
use coder_agent::config::Config;
use coder_agent::llm::{
    BackendMode, ChatMessage, GenerationOptions, LlmClient, LlmError, ModelRequest,
    RemoteLlmClient, Role,
};

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
    tunnel_header: Arc<Mutex<Vec<bool>>>,
}

impl Recorder {
    fn record(&self, headers: &HeaderMap, body: Value) -> usize {
        self.bodies.lock().unwrap().push(body);
        self.tunnel_header
            .lock()
            .unwrap()
            .push(headers.get("ngrok-skip-browser-warning").is_some());
        self.calls.fetch_add(1, Ordering::SeqCst) + 1
    }
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client(url: &str, configure: impl FnOnce(&mut Config)) -> RemoteLlmClient {
    let mut config = Config::new(url.to_string(), std::env::temp_dir());
    configure(&mut config);
    RemoteLlmClient::new(&config).unwrap()
}

fn request(stream: bool) -> ModelRequest {
    ModelRequest {
        messages: vec![
            ChatMessage::system("be brief"),
            ChatMessage::new(Role::User, "hi"),
        ],
        options: GenerationOptions::default(),
        stream,
    }
}

fn ndjson(lines: &[Value]) -> String {
    lines
        .iter()
        .map(|l| format!("{}\n", l))
        .collect::<String>()
}

async fn streaming_chat(
    State(rec): State<Recorder>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> String {
    rec.record(&headers, body);
    ndjson(&[
        json!({"content": "Hel"}),
        json!({"content": "lo"}),
        json!({"content": "", "done": true}),
        json!({"content": "ignored after done"}),
    ])
}

#[tokio::test]
async fn chat_stream_concatenates_fragments_in_order() {
    let rec = Recorder::default();
    let url = serve(
        Router::new()
            .route("/chat", post(streaming_chat))
            .with_state(rec.clone()),
    )
    .await;

    let llm = client(&url, |_| {});
    let mut pieces = Vec::new();
    let mut sink = |s: &str| pieces.push(s.to_string());
    let text = llm.complete(&request(true), &mut sink).await.unwrap();

    assert_eq!(text, "Hello");
    assert_eq!(pieces, vec!["Hel", "lo"]);

    let body = rec.bodies.lock().unwrap()[0].clone();
    assert_eq!(body["stream"], json!(true));
    assert_eq!(body["messages"][1], json!({"role": "user", "content": "hi"}));
    assert!(body.get("options").is_none());
    assert_eq!(*rec.tunnel_header.lock().unwrap(), vec![true]);
}

async fn slow_chat(Json(_body): Json<Value>) -> Body {
    let lines: Vec<String> = [
        json!({"content": "a"}),
        json!({"content": "b"}),
        json!({"content": "c"}),
        json!({"content": "", "done": true}),
    ]
    .iter()
    .map(|l| format!("{}\n", l))
    .collect();

    Body::from_stream(futures::stream::iter(lines).then(|line| async move {
        tokio::time::sleep(Duration::from_millis(600)).await;
        Ok::<_, Infallible>(line)
    }))
}

#[tokio::test]
async fn long_streams_are_not_cut_off_by_the_request_timeout() {
    let url = serve(Router::new().route("/chat", post(slow_chat))).await;

    // Whole stream takes ~2.4s, each gap stays under the 1s timeout.
    let llm = client(&url, |c| c.request_timeout_secs = 1);
    let text = llm.complete(&request(true), &mut |_: &str| {}).await.unwrap();

    assert_eq!(text, "abc");
}

async fn generate(State(rec): State<Recorder>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    rec.record(&headers, body);
    Json(json!({"response": "generated text"}))
}

#[tokio::test]
async fn generate_mode_sends_a_flattened_prompt() {
    let rec = Recorder::default();
    let url = serve(
        Router::new()
            .route("/generate", post(generate))
            .with_state(rec.clone()),
    )
    .await;

    let llm = client(&url, |c| c.backend_mode = BackendMode::Generate);
    let mut request = request(false);
    request.options.max_tokens = Some(64);
    let text = llm.complete(&request, &mut |_: &str| {}).await.unwrap();

    assert_eq!(text, "generated text");
    let body = rec.bodies.lock().unwrap()[0].clone();
    assert_eq!(body["prompt"], json!("System: be brief\n\nUser: hi\n"));
    assert_eq!(body["stream"], json!(false));
    assert_eq!(body["options"], json!({"num_predict": 64}));
}

async fn flaky_chat(State(rec): State<Recorder>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if rec.record(&headers, body) == 1 {
        return (StatusCode::SERVICE_UNAVAILABLE, "model loading").into_response();
    }
    ndjson(&[json!({"content": "ready"}), json!({"done": true})]).into_response()
}

#[tokio::test]
async fn retries_server_errors_before_any_output() {
    let rec = Recorder::default();
    let url = serve(
        Router::new()
            .route("/chat", post(flaky_chat))
            .with_state(rec.clone()),
    )
    .await;

    let llm = client(&url, |c| c.max_retries = 2);
    let text = llm.complete(&request(true), &mut |_: &str| {}).await.unwrap();

    assert_eq!(text, "ready");
    assert_eq!(rec.calls.load(Ordering::SeqCst), 2);
}

async fn broken_chat(State(rec): State<Recorder>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    rec.record(&headers, body);
    (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
}

#[tokio::test]
async fn gives_up_after_max_retries() {
    let rec = Recorder::default();
    let url = serve(
        Router::new()
            .route("/chat", post(broken_chat))
            .with_state(rec.clone()),
    )
    .await;

    let llm = client(&url, |c| c.max_retries = 2);
    let err = llm
        .complete(&request(true), &mut |_: &str| {})
        .await
        .unwrap_err();

    assert!(matches!(err, LlmError::Status { status: 500, ref body } if body == "boom"));
    assert_eq!(rec.calls.load(Ordering::SeqCst), 2);
}

async fn failing_midstream(State(rec): State<Recorder>, headers: HeaderMap, Json(body): Json<Value>) -> String {
    rec.record(&headers, body);
    ndjson(&[json!({"content": "partial"}), json!({"error": "out of memory"})])
}

#[tokio::test]
async fn does_not_retry_once_text_was_delivered() {
    let rec = Recorder::default();
    let url = serve(
        Router::new()
            .route("/chat", post(failing_midstream))
            .with_state(rec.clone()),
    )
    .await;

    let llm = client(&url, |c| c.max_retries = 3);
    let err = llm
        .complete(&request(true), &mut |_: &str| {})
        .await
        .unwrap_err();

    assert!(matches!(err, LlmError::Backend(ref m) if m == "out of memory"));
    assert_eq!(rec.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn health_reports_status_and_model() {
    let url = serve(Router::new().route(
        "/health",
        get(|| async { Json(json!({"status": "ok", "model": "qwen2.5-coder"})) }),
    ))
    .await;

    let health = client(&url, |_| {}).health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.model.as_deref(), Some("qwen2.5-coder"));
}

#[tokio::test]
async fn health_on_a_dead_port_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let err = client(&url, |_| {}).health().await.unwrap_err();
    assert!(matches!(err, LlmError::Transport(_)));
}

async fn scripted_chat(State(rec): State<Recorder>, headers: HeaderMap, Json(body): Json<Value>) -> String {
    let reply = if rec.record(&headers, body) == 1 {
        r#"{"tool": "read_file", "arguments": {"path": "notes.txt"}}"#
    } else {
        "The notes say: remember the milk"
    };
    ndjson(&[json!({"content": reply}), json!({"done": true})])
}

#[tokio::test]
async fn agent_completes_a_tool_turn_over_http() {
    let rec = Recorder::default();
    let url = serve(
        Router::new()
            .route("/chat", post(scripted_chat))
            .with_state(rec.clone()),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "remember the milk\n").unwrap();
    let config = Config::new(url, dir.path().to_path_buf());
    let llm = Arc::new(RemoteLlmClient::new(&config).unwrap());
    let mut agent = Agent::new(config, llm).unwrap();

    let outcome = agent
        .run_turn("What do my notes say?", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.stop, StopReason::Answered);
    assert_eq!(outcome.reply, "The notes say: remember the milk");

    let second = rec.bodies.lock().unwrap()[1].clone();
    let messages = second["messages"].as_array().unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last["role"], json!("user"));
    assert!(last["content"]
        .as_str()
        .unwrap()
        .contains("remember the milk"));
}
