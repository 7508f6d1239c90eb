//! Provider for an OpenAI-compatible hosted chat API.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::error::{GenError, InitError};
use super::flight::FlightTracker;
use super::params::{Dialect, GenerationParams};
use super::{ProviderState, StateCell};
use crate::catalog::{param, ModelConfig};
use crate::config::RemoteConfig;

pub struct RemoteProvider {
    config: ModelConfig,
    base_url: String,
    key_env: String,
    timeout: std::time::Duration,
    client: reqwest::Client,
    api_key: parking_lot::RwLock<Option<String>>,
    state: StateCell,
    flights: FlightTracker,
}

impl RemoteProvider {
    pub fn new(config: ModelConfig, settings: &RemoteConfig, client: reqwest::Client) -> Self {
        let base_url = config
            .param_str(param::BASE_URL)
            .unwrap_or(&settings.base_url)
            .trim_end_matches('/')
            .to_string();
        let key_env = config
            .param_str(param::API_KEY_ENV)
            .unwrap_or(&settings.api_key_env)
            .to_string();
        Self {
            config,
            base_url,
            key_env,
            timeout: settings.timeout,
            client,
            api_key: parking_lot::RwLock::new(None),
            state: StateCell::new(),
            flights: FlightTracker::new(),
        }
    }

    pub fn state(&self) -> ProviderState {
        self.state.get()
    }

    /// Generations currently holding a flight guard.
    pub fn in_flight(&self) -> u32 {
        self.flights.in_flight_count()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Model id sent upstream: `remote_model` when set, else the entry name.
    pub fn remote_model(&self) -> &str {
        self.config
            .param_str(param::REMOTE_MODEL)
            .unwrap_or(&self.config.name)
    }

    pub async fn initialize(&self) -> Result<(), InitError> {
        if self.state.get() == ProviderState::Ready {
            return Ok(());
        }
        self.state.set(ProviderState::Initializing);
        match std::env::var(&self.key_env) {
            Ok(key) if !key.trim().is_empty() => {
                *self.api_key.write() = Some(key);
                self.state.set(ProviderState::Ready);
                info!(model = %self.config.name, base_url = %self.base_url, "Remote backend ready");
                Ok(())
            }
            _ => {
                self.state.set(ProviderState::Failed);
                Err(InitError::BackendUnavailable(format!(
                    "API key variable {} is not set",
                    self.key_env
                )))
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
        let key = self
            .api_key
            .read()
            .clone()
            .ok_or(GenError::NotReady(ProviderState::Unloaded))?;

        let params = params.resolve(&self.config);
        let mut body = Dialect::Remote.translate(&params);
        let mut messages = Vec::new();
        if let Some(system) = params.system_prompt.as_deref() {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));
        body.insert("model".to_string(), Value::from(self.remote_model()));
        body.insert("messages".to_string(), Value::Array(messages));

        let url = format!("{}/chat/completions", self.base_url);
        let request = async {
            let resp = self
                .client
                .post(&url)
                .bearer_auth(&key)
                .json(&body)
                .send()
                .await?
                .error_for_status()?;
            let reply: Value = resp.json().await?;
            reply
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(GenError::EmptyResponse)
        };

        tokio::select! {
            outcome = tokio::time::timeout(self.timeout, request) => {
                outcome.unwrap_or(Err(GenError::Timeout(self.timeout)))
            }
            _ = cancel.cancelled() => Err(GenError::Cancelled),
        }
    }

    /// Forget the key. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        if matches!(self.state.get(), ProviderState::Unloaded | ProviderState::Uninitialized) {
            return;
        }
        self.state.set(ProviderState::Unloaded);
        let _ = self.flights.drain(self.timeout).await;
        self.api_key.write().take();
    }
}
