//! Inference providers: one model bound to one backend.
//!
//! Three variants share a lifecycle (`initialize` → `generate`* →
//! `cleanup`) and a state machine. [`ProviderHandle`] pairs a provider with
//! the config it was built from and is what the registry holds.

mod direct;
mod error;
mod factory;
mod flight;
#[cfg(feature = "gguf")]
mod llama;
mod native;
mod params;
mod remote;
mod server;

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

pub use direct::{fallback_param_sets, initial_params, DirectProvider};
pub use error::{GenError, InitError};
pub use factory::ProviderFactory;
pub use flight::{DrainError, FlightGuard, FlightTracker};
pub use native::{
    default_native_backend, resolve_threads, NativeBackend, NativeError, NativeModel, NativeParams,
    SamplingParams, UnavailableBackend,
};
pub use params::{
    Dialect, GenerationParams, NeutralField, DEFAULT_MAX_TOKENS, SERVER_DEFAULT_MAX_TOKENS,
};
pub use remote::RemoteProvider;
pub use server::{build_args, ServerProvider, DEFAULT_SYSTEM_PROMPT};

use crate::catalog::{BackendType, ModelConfig};
use crate::telemetry::{generate_span, record_generation, SpanExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
    Unloaded,
}

impl ProviderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Unloaded => "unloaded",
        }
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) struct StateCell(parking_lot::RwLock<ProviderState>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(parking_lot::RwLock::new(ProviderState::Uninitialized))
    }

    pub(crate) fn get(&self) -> ProviderState {
        *self.0.read()
    }

    pub(crate) fn set(&self, next: ProviderState) {
        *self.0.write() = next;
    }
}

/// How a ready provider reaches its backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionInfo {
    InProcess { params: Option<NativeParams> },
    Http { base_url: String, pid: Option<u32>, reused: bool },
    Remote { base_url: String },
}

pub enum Provider {
    Direct(DirectProvider),
    Server(ServerProvider),
    Remote(RemoteProvider),
}

impl Provider {
    pub fn backend_type(&self) -> BackendType {
        match self {
            Self::Direct(_) => BackendType::Direct,
            Self::Server(_) => BackendType::Server,
            Self::Remote(_) => BackendType::RemoteApi,
        }
    }

    pub fn state(&self) -> ProviderState {
        match self {
            Self::Direct(p) => p.state(),
            Self::Server(p) => p.state(),
            Self::Remote(p) => p.state(),
        }
    }

    pub fn in_flight(&self) -> u32 {
        match self {
            Self::Direct(p) => p.in_flight(),
            Self::Server(p) => p.in_flight(),
            Self::Remote(p) => p.in_flight(),
        }
    }

    pub async fn initialize(&self) -> Result<(), InitError> {
        match self {
            Self::Direct(p) => p.initialize().await,
            Self::Server(p) => p.initialize().await,
            Self::Remote(p) => p.initialize().await,
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<String, GenError> {
        match self {
            Self::Direct(p) => p.generate(prompt, params, cancel).await,
            Self::Server(p) => p.generate(prompt, params, cancel).await,
            Self::Remote(p) => p.generate(prompt, params, cancel).await,
        }
    }

    pub async fn cleanup(&self) {
        match self {
            Self::Direct(p) => p.cleanup().await,
            Self::Server(p) => p.cleanup().await,
            Self::Remote(p) => p.cleanup().await,
        }
    }

    pub fn connection(&self) -> ConnectionInfo {
        match self {
            Self::Direct(p) => ConnectionInfo::InProcess {
                params: p.loaded_params(),
            },
            Self::Server(p) => p.connection(),
            Self::Remote(p) => ConnectionInfo::Remote {
                base_url: p.base_url().to_string(),
            },
        }
    }
}

/// A provider together with the config it serves.
pub struct ProviderHandle {
    id: Uuid,
    config: ModelConfig,
    provider: Provider,
}

impl ProviderHandle {
    pub fn new(config: ModelConfig, provider: Provider) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            provider,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn backend_type(&self) -> BackendType {
        self.provider.backend_type()
    }

    pub fn state(&self) -> ProviderState {
        self.provider.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ProviderState::Ready
    }

    pub fn connection(&self) -> ConnectionInfo {
        self.provider.connection()
    }

    /// Metadata reported by a llama-server backend.
    pub fn info(&self) -> Option<serde_json::Value> {
        match &self.provider {
            Provider::Server(p) => p.server_info(),
            _ => None,
        }
    }

    pub async fn initialize(&self) -> Result<(), InitError> {
        self.provider.initialize().await
    }

    pub async fn cleanup(&self) {
        self.provider.cleanup().await
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<String, GenError> {
        let backend = self.backend_type().as_str();
        let span = generate_span(&self.config.name, backend);
        let started = Instant::now();
        let result = self
            .provider
            .generate(prompt, params, cancel)
            .instrument(span.clone())
            .await;
        let elapsed = started.elapsed();
        span.record("latency_ms", elapsed.as_millis() as u64);
        span.record_result(&result);
        record_generation(backend, result.is_ok(), elapsed);
        result
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.id)
            .field("model", &self.config.name)
            .field("backend", &self.backend_type())
            .field("state", &self.state())
            .finish()
    }
}
