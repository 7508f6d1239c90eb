//! Provider that drives a llama-server child over HTTP.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{GenError, InitError};
use super::flight::FlightTracker;
use super::params::{Dialect, GenerationParams};
use super::{ConnectionInfo, ProviderState, StateCell};
use crate::catalog::{param, ModelConfig};
use crate::config::ServerConfig;
use crate::supervisor::{OrphanGuard, ProcessSupervisor, SupervisorOptions};
use crate::telemetry::record_server_start;

/// System message sent with chat requests when the caller gives none.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

fn endpoint(config: &ModelConfig, settings: &ServerConfig) -> (String, u16) {
    let host = config
        .param_str(param::HOST)
        .unwrap_or(&settings.host)
        .to_string();
    let port = config
        .param_u32(param::PORT)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(settings.port);
    (host, port)
}

/// Command line for `llama-server` serving `config`.
pub fn build_args(config: &ModelConfig, settings: &ServerConfig) -> Vec<String> {
    let (host, port) = endpoint(config, settings);
    let mut args = vec![
        "-m".to_string(),
        config.path.display().to_string(),
        "--port".to_string(),
        port.to_string(),
        "--host".to_string(),
        host,
        "-c".to_string(),
        config.context_size().to_string(),
    ];
    if let Some(template) = config.chat_format.server_template() {
        args.push("--chat-template".to_string());
        args.push(template.to_string());
    }
    if let Some(layers) = config.gpu_layers() {
        args.push("--n-gpu-layers".to_string());
        args.push(layers.to_string());
    }
    if let Some(batch) = config.batch_size() {
        args.push("-b".to_string());
        args.push(batch.to_string());
    }
    if let Some(parallel) = settings.parallel {
        args.push("-np".to_string());
        args.push(parallel.to_string());
    }
    if let Some(threads) = settings.threads {
        args.push("--threads".to_string());
        args.push(threads.to_string());
    }
    args
}

pub struct ServerProvider {
    config: ModelConfig,
    settings: ServerConfig,
    client: reqwest::Client,
    supervisor: ProcessSupervisor,
    state: StateCell,
    flights: FlightTracker,
    shutdown: RwLock<CancellationToken>,
    info: RwLock<Option<Value>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl ServerProvider {
    pub fn new(
        config: ModelConfig,
        settings: ServerConfig,
        client: reqwest::Client,
        guard: Arc<OrphanGuard>,
    ) -> Self {
        let (host, port) = endpoint(&config, &settings);
        let supervisor = ProcessSupervisor::new(
            host,
            port,
            SupervisorOptions::from(&settings),
            client.clone(),
            guard,
        )
        .with_label(config.name.clone());
        Self {
            config,
            settings,
            client,
            supervisor,
            state: StateCell::new(),
            flights: FlightTracker::new(),
            shutdown: RwLock::new(CancellationToken::new()),
            info: RwLock::new(None),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ProviderState {
        self.state.get()
    }

    /// Generations currently holding a flight guard.
    pub fn in_flight(&self) -> u32 {
        self.flights.in_flight_count()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn base_url(&self) -> String {
        self.supervisor.base_url()
    }

    /// Server metadata fetched at initialization, when the server offered any.
    pub fn server_info(&self) -> Option<Value> {
        self.info.read().clone()
    }

    pub fn connection(&self) -> ConnectionInfo {
        let reused = self.supervisor.is_reused();
        ConnectionInfo::Http {
            base_url: self.base_url(),
            pid: if reused { None } else { self.supervisor.pid() },
            reused,
        }
    }

    pub async fn initialize(&self) -> Result<(), InitError> {
        let _init = self.init_lock.lock().await;
        if self.state.get() == ProviderState::Ready {
            return Ok(());
        }
        self.state.set(ProviderState::Initializing);

        match self.try_initialize().await {
            Ok(()) => {
                *self.shutdown.write() = CancellationToken::new();
                self.state.set(ProviderState::Ready);
                Ok(())
            }
            Err(e) => {
                self.state.set(ProviderState::Failed);
                Err(e)
            }
        }
    }

    async fn try_initialize(&self) -> Result<(), InitError> {
        if !self.config.path.is_file() {
            return Err(InitError::ModelFileMissing(self.config.path.clone()));
        }
        let args = build_args(&self.config, &self.settings);
        self.supervisor
            .start(self.settings.executable.as_deref(), &args)
            .await?;
        let reused = self.supervisor.is_reused();
        record_server_start(reused);

        let info = self.fetch_info().await;
        if reused {
            self.check_served_model(info.as_ref());
        }
        *self.info.write() = info;
        info!(model = %self.config.name, addr = %self.base_url(), reused, "Server backend ready");
        Ok(())
    }

    async fn get_json(&self, path: &str) -> Option<Value> {
        let url = format!("{}{path}", self.base_url());
        let resp = self
            .client
            .get(&url)
            .timeout(self.settings.probe_timeout)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<Value>().await.ok()
    }

    /// `/props`, else the first entry of `/v1/models`.
    async fn fetch_info(&self) -> Option<Value> {
        if let Some(props) = self.get_json("/props").await {
            return Some(props);
        }
        let models = self.get_json("/v1/models").await?;
        match models.get("data").and_then(Value::as_array) {
            Some(list) => list.first().cloned(),
            None => Some(models),
        }
    }

    fn check_served_model(&self, info: Option<&Value>) {
        let Some(info) = info else { return };
        let served = ["model_path", "id", "model"]
            .iter()
            .find_map(|k| info.get(*k).and_then(Value::as_str));
        let wanted = self
            .config
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        if let (Some(served), Some(wanted)) = (served, wanted) {
            if !served.contains(&wanted) {
                warn!(
                    model = %self.config.name,
                    served,
                    "Reused server is serving a different model"
                );
            }
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<String, GenError> {
        // Track before checking state.
        let _flight = self.flights.track();
        let state = self.state.get();
        if state != ProviderState::Ready {
            return Err(GenError::NotReady(state));
        }
        let stop = self.shutdown.read().child_token();
        let params = params.resolve(&self.config);
        let timeout = self.settings.generation_timeout;

        let work = async {
            match self.chat(prompt, &params).await {
                Ok(text) => Ok(text),
                Err(e) => {
                    debug!(error = %e, "Chat endpoint failed, falling back to /completion");
                    self.complete(prompt, &params).await
                }
            }
        };

        tokio::select! {
            outcome = tokio::time::timeout(timeout, work) => {
                outcome.unwrap_or(Err(GenError::Timeout(timeout)))
            }
            _ = cancel.cancelled() => Err(GenError::Cancelled),
            _ = stop.cancelled() => Err(GenError::Cancelled),
        }
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, GenError> {
        let url = format!("{}{path}", self.base_url());
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<Value>().await?)
    }

    async fn chat(&self, prompt: &str, params: &GenerationParams) -> Result<String, GenError> {
        let mut body = Dialect::ServerChat.translate(params);
        let system = params
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        body.insert(
            "messages".to_string(),
            json!([
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ]),
        );
        body.insert("stream".to_string(), Value::Bool(false));

        let reply = self.post_json("/v1/chat/completions", Value::Object(body)).await?;
        reply
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(GenError::EmptyResponse)
    }

    async fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<String, GenError> {
        let mut body = Dialect::ServerCompletion.translate(params);
        body.insert("prompt".to_string(), Value::from(prompt));
        body.insert("stream".to_string(), Value::Bool(false));

        let reply = self.post_json("/completion", Value::Object(body)).await?;
        reply
            .get("content")
            .and_then(Value::as_str)
            .or_else(|| reply.pointer("/choices/0/text").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or(GenError::EmptyResponse)
    }

    /// Stop the server this provider started. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let _init = self.init_lock.lock().await;
        if matches!(self.state.get(), ProviderState::Unloaded | ProviderState::Uninitialized) {
            return;
        }
        self.state.set(ProviderState::Unloaded);

        let grace = self.settings.terminate_timeout;
        if self.flights.drain(grace).await.is_err() {
            self.shutdown.read().cancel();
            let _ = self.flights.drain(grace).await;
        }
        if let Err(e) = self.supervisor.shutdown().await {
            warn!(model = %self.config.name, error = %e, "Server shutdown incomplete");
        }
        self.info.write().take();
        info!(model = %self.config.name, "Server backend released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackendType, ChatFormat};

    #[test]
    fn test_build_args_minimal() {
        let config = ModelConfig::new("m", "/models/m.gguf", BackendType::Server);
        let settings = ServerConfig::default();
        let args = build_args(&config, &settings);
        assert_eq!(
            args,
            vec!["-m", "/models/m.gguf", "--port", "8080", "--host", "127.0.0.1", "-c", "4096"]
        );
    }

    #[test]
    fn test_build_args_full() {
        let mut config = ModelConfig::new("m", "/models/m.gguf", BackendType::Server)
            .with_param(param::PORT, 9001u32)
            .with_param(param::CONTEXT_SIZE, 8192u32)
            .with_param(param::GPU_LAYERS, 20u32);
        config.chat_format = ChatFormat::Llama3;
        let settings = ServerConfig {
            parallel: Some(2),
            threads: Some(6),
            ..ServerConfig::default()
        };
        let args = build_args(&config, &settings).join(" ");
        assert!(args.contains("--port 9001"));
        assert!(args.contains("-c 8192"));
        assert!(args.contains("--chat-template llama3"));
        assert!(args.contains("--n-gpu-layers 20"));
        assert!(args.contains("-np 2"));
        assert!(args.contains("--threads 6"));
    }

    #[test]
    fn test_alpaca_has_no_template_flag() {
        let mut config = ModelConfig::new("m", "/models/m.gguf", BackendType::Server);
        config.chat_format = ChatFormat::Alpaca;
        let args = build_args(&config, &ServerConfig::default());
        assert!(!args.iter().any(|a| a == "--chat-template"));
    }
}
