//! ServerProvider against an in-process llama-server stand-in.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{model_file, runtime, seed_store, test_config, ScriptedBackend};
use gg_orchestrator::catalog::{BackendType, ModelConfig};
use gg_orchestrator::config::ServerConfig;
use gg_orchestrator::provider::{
    ConnectionInfo, GenError, GenerationParams, ProviderState, ServerProvider,
    DEFAULT_SYSTEM_PROMPT,
};
use gg_orchestrator::supervisor::OrphanGuard;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Mock {
    chat_fails: AtomicBool,
    last_chat: Mutex<Option<Value>>,
    last_completion: Mutex<Option<Value>>,
    completions: AtomicUsize,
}

async fn health() -> &'static str {
    "ok"
}

async fn props() -> Json<Value> {
    Json(json!({"model_path": "/models/alpha.gguf", "n_ctx": 4096}))
}

async fn chat(State(mock): State<Arc<Mock>>, Json(body): Json<Value>) -> impl IntoResponse {
    *mock.last_chat.lock() = Some(body.clone());
    if mock.chat_fails.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"})));
    }
    let prompt = body
        .pointer("/messages/1/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if prompt.contains("slow") {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    (
        StatusCode::OK,
        Json(json!({"choices": [{"message": {"role": "assistant", "content": format!("chat: {prompt}")}}]})),
    )
}

async fn completion(State(mock): State<Arc<Mock>>, Json(body): Json<Value>) -> Json<Value> {
    mock.completions.fetch_add(1, Ordering::SeqCst);
    *mock.last_completion.lock() = Some(body.clone());
    let prompt = body.get("prompt").and_then(Value::as_str).unwrap_or_default();
    Json(json!({"content": format!("completion: {prompt}")}))
}

async fn spawn_mock() -> (u16, Arc<Mock>) {
    let mock = Arc::new(Mock::default());
    let app = Router::new()
        .route("/health", get(health))
        .route("/props", get(props))
        .route("/v1/chat/completions", post(chat))
        .route("/completion", post(completion))
        .with_state(mock.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, mock)
}

fn settings(port: u16) -> ServerConfig {
    ServerConfig {
        port,
        health_interval: Duration::from_millis(20),
        health_attempts: 3,
        probe_timeout: Duration::from_millis(500),
        generation_timeout: Duration::from_secs(10),
        terminate_timeout: Duration::from_secs(1),
        ..ServerConfig::default()
    }
}

async fn ready_provider(dir: &std::path::Path, port: u16) -> ServerProvider {
    let path = model_file(dir, "alpha.gguf");
    let config = ModelConfig::new("alpha", path, BackendType::Server);
    let provider = ServerProvider::new(
        config,
        settings(port),
        reqwest::Client::new(),
        Arc::new(OrphanGuard::new()),
    );
    provider.initialize().await.unwrap();
    provider
}

// ============================================================================
// Initialization
// ============================================================================

#[tokio::test]
async fn test_initialize_adopts_running_server() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _mock) = spawn_mock().await;
    let provider = ready_provider(dir.path(), port).await;

    assert_eq!(provider.state(), ProviderState::Ready);
    match provider.connection() {
        ConnectionInfo::Http { base_url, pid, reused } => {
            assert_eq!(base_url, format!("http://127.0.0.1:{port}"));
            assert!(pid.is_none());
            assert!(reused);
        }
        other => panic!("unexpected connection {other:?}"),
    }
    let info = provider.server_info().unwrap();
    assert_eq!(info["n_ctx"], 4096);
}

#[tokio::test]
async fn test_initialize_missing_file_fails() {
    let (port, _mock) = spawn_mock().await;
    let config = ModelConfig::new("ghost", "/nonexistent/ghost.gguf", BackendType::Server);
    let provider = ServerProvider::new(
        config,
        settings(port),
        reqwest::Client::new(),
        Arc::new(OrphanGuard::new()),
    );
    assert!(provider.initialize().await.is_err());
    assert_eq!(provider.state(), ProviderState::Failed);
}

// ============================================================================
// Generation
// ============================================================================

#[tokio::test]
async fn test_chat_request_body() {
    let dir = tempfile::tempdir().unwrap();
    let (port, mock) = spawn_mock().await;
    let provider = ready_provider(dir.path(), port).await;

    let params = GenerationParams {
        repetition_penalty: Some(1.1),
        ..GenerationParams::default().with_max_tokens(64)
    };
    let text = provider
        .generate("hello", &params, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(text, "chat: hello");

    let body = mock.last_chat.lock().clone().unwrap();
    assert_eq!(body["n_predict"], 64);
    assert!(body.get("max_tokens").is_none());
    assert!(body["repeat_penalty"].as_f64().unwrap() > 1.0);
    assert_eq!(body["top_k"], 40);
    assert_eq!(body["repeat_last_n"], 64);
    assert_eq!(body["stream"], false);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][0]["content"], DEFAULT_SYSTEM_PROMPT);
    assert_eq!(body["messages"][1]["content"], "hello");
}

#[tokio::test]
async fn test_chat_uses_caller_system_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let (port, mock) = spawn_mock().await;
    let provider = ready_provider(dir.path(), port).await;

    let params = GenerationParams {
        system_prompt: Some("Answer tersely.".to_string()),
        ..GenerationParams::default()
    };
    provider.generate("hi", &params, CancellationToken::new()).await.unwrap();

    let body = mock.last_chat.lock().clone().unwrap();
    assert_eq!(body["messages"][0]["content"], "Answer tersely.");
    assert_eq!(body["n_predict"], 512);
}

#[tokio::test]
async fn test_chat_failure_falls_back_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let (port, mock) = spawn_mock().await;
    let provider = ready_provider(dir.path(), port).await;
    mock.chat_fails.store(true, Ordering::SeqCst);

    let text = provider
        .generate("hello", &GenerationParams::default().with_max_tokens(32), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(text, "completion: hello");
    assert_eq!(mock.completions.load(Ordering::SeqCst), 1);

    let body = mock.last_completion.lock().clone().unwrap();
    assert_eq!(body["max_tokens"], 32);
    assert_eq!(body["stop"], json!([]));
    assert!(body.get("n_predict").is_none());
}

#[tokio::test]
async fn test_cancel_keeps_provider_ready() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _mock) = spawn_mock().await;
    let provider = ready_provider(dir.path(), port).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = provider
        .generate("slow please", &GenerationParams::default(), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, GenError::Cancelled));
    assert_eq!(provider.state(), ProviderState::Ready);

    let text = provider
        .generate("again", &GenerationParams::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(text, "chat: again");
}

#[tokio::test]
async fn test_cleanup_leaves_adopted_server_running() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _mock) = spawn_mock().await;
    let provider = ready_provider(dir.path(), port).await;

    provider.cleanup().await;
    provider.cleanup().await;
    assert_eq!(provider.state(), ProviderState::Unloaded);
    assert!(provider.server_info().is_none());
    assert!(provider.supervisor().probe().await);

    let err = provider
        .generate("late", &GenerationParams::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GenError::NotReady(ProviderState::Unloaded)));
    assert_eq!(provider.in_flight(), 0);
}

// ============================================================================
// Escalation
// ============================================================================

#[tokio::test]
async fn test_direct_failure_escalates_to_server() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _mock) = spawn_mock().await;
    seed_store(dir.path(), &[("alpha", "alpha.gguf")]);
    let mut config = test_config(dir.path());
    config.loading.allow_server_escalation = true;
    config.server.port = port;
    let backend = Arc::new(ScriptedBackend::always_ok().failing_for("alpha"));
    let rt = runtime(config, backend);

    let handle = rt.try_load("alpha").await.unwrap();
    assert_eq!(handle.backend_type(), BackendType::Server);
    assert_eq!(handle.config().backend_type, BackendType::Server);
    assert_eq!(rt.get_active_model().unwrap().backend_type, BackendType::Server);
    assert_eq!(rt.registry().active_config().unwrap().backend_type, BackendType::Server);
    assert!(handle.info().is_some());
    assert_eq!(rt.store().get("alpha").unwrap().backend_type, BackendType::Server);
    assert_eq!(rt.ledger().count("alpha"), 0);

    let text = rt.generate("hello", &GenerationParams::default()).await;
    assert_eq!(text, "chat: hello");
}
