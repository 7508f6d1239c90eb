//! Serialized model loading, escalation and automatic fallback.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn, Instrument};

use super::ledger::FailureLedger;
use super::preload::WarmupPool;
use super::registry::ActiveModelRegistry;
use crate::catalog::{name_key, param, BackendType, ConfigStore, ModelConfig, StoreError};
use crate::config::LoadingConfig;
use crate::provider::{InitError, ProviderFactory, ProviderHandle};
use crate::sizing::{estimate_for_file, VramTier};
use crate::telemetry::{load_span, record_load_failure, record_load_success, SpanExt};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Model config not found: {0}")]
    ConfigNotFound(String),

    #[error("Model file for '{name}' not found: {}", .path.display())]
    ModelFileMissing { name: String, path: PathBuf },

    #[error("Backend unavailable for '{name}': {reason}")]
    BackendUnavailable { name: String, reason: String },

    #[error("Initialization of '{name}' failed after {attempts} attempt(s): {last_error}")]
    InitializationFailure {
        name: String,
        attempts: usize,
        last_error: String,
    },

    #[error("Server for '{name}' not healthy after {attempts} probe(s)")]
    ServerStartupTimeout { name: String, attempts: u32 },

    #[error("Server supervision failed for '{name}': {reason}")]
    Supervisor { name: String, reason: String },

    #[error("No fallback candidate could be loaded (tried {tried:?}, skipped {skipped:?})")]
    NoCandidates { tried: Vec<String>, skipped: Vec<String> },

    #[error("Config store error: {0}")]
    Store(#[from] StoreError),
}

impl LoadError {
    fn from_init(name: &str, e: InitError) -> Self {
        let name = name.to_string();
        match e {
            InitError::ModelFileMissing(path) => Self::ModelFileMissing { name, path },
            InitError::BackendUnavailable(reason) => Self::BackendUnavailable { name, reason },
            InitError::InitializationFailure { attempts, last_error } => Self::InitializationFailure {
                name,
                attempts,
                last_error,
            },
            InitError::ServerStartupTimeout { attempts } => Self::ServerStartupTimeout { name, attempts },
            InitError::Supervisor(e) => Self::Supervisor {
                name,
                reason: e.to_string(),
            },
        }
    }

    /// Direct failures a llama-server might still overcome.
    pub fn is_escalatable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::InitializationFailure { .. }
        )
    }
}

pub struct LoadOrchestrator {
    store: Arc<ConfigStore>,
    registry: Arc<ActiveModelRegistry>,
    ledger: Arc<FailureLedger>,
    factory: ProviderFactory,
    warmup: Arc<WarmupPool>,
    options: LoadingConfig,
    vram_tier: VramTier,
    load_lock: tokio::sync::Mutex<()>,
}

impl LoadOrchestrator {
    pub fn new(
        store: Arc<ConfigStore>,
        registry: Arc<ActiveModelRegistry>,
        ledger: Arc<FailureLedger>,
        factory: ProviderFactory,
        warmup: Arc<WarmupPool>,
        options: LoadingConfig,
        vram_tier: VramTier,
    ) -> Self {
        Self {
            store,
            registry,
            ledger,
            factory,
            warmup,
            options,
            vram_tier,
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ActiveModelRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<FailureLedger> {
        &self.ledger
    }

    pub fn warmup(&self) -> &Arc<WarmupPool> {
        &self.warmup
    }

    pub fn options(&self) -> &LoadingConfig {
        &self.options
    }

    /// Load `name` and make it the active model.
    ///
    /// Loads are serialized; a second call waits for the first. An explicit
    /// load is attempted even when the model's failure budget is spent.
    pub async fn load(&self, name: &str) -> Result<Arc<ProviderHandle>, LoadError> {
        let _serial = self.load_lock.lock().await;
        self.load_locked(name).await
    }

    async fn load_locked(&self, name: &str) -> Result<Arc<ProviderHandle>, LoadError> {
        let span = load_span(name);
        let result = self.load_inner(name).instrument(span.clone()).await;
        if let Ok(handle) = &result {
            span.record("backend", handle.backend_type().as_str());
        }
        span.record_result(&result);
        result
    }

    async fn load_inner(&self, name: &str) -> Result<Arc<ProviderHandle>, LoadError> {
        let config = match self.store.get(name) {
            Ok(c) => c,
            Err(StoreError::NotFound(_)) => return Err(LoadError::ConfigNotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        };

        // Checked before unloading so a missing file never costs the
        // currently active model.
        if !config.is_loadable() {
            let err = LoadError::ModelFileMissing {
                name: config.name.clone(),
                path: config.path.clone(),
            };
            self.count_failure(&config, &err);
            return Err(err);
        }

        self.unload_current().await;
        let config = self.ensure_gpu_estimate(config);
        let started = Instant::now();

        let err = match self.bring_up(&config, config.backend_type).await {
            Ok(handle) => return Ok(self.activate(handle, started)),
            Err(e) => e,
        };

        if config.backend_type == BackendType::Direct
            && self.options.allow_server_escalation
            && config.allows_server_fallback()
            && err.is_escalatable()
        {
            warn!(model = %config.name, error = %err, "Direct load failed, escalating to llama-server");
            let escalated = ModelConfig {
                backend_type: BackendType::Server,
                ..config.clone()
            };
            match self.bring_up(&escalated, BackendType::Server).await {
                Ok(handle) => {
                    if let Err(e) = self
                        .store
                        .update(&config.name, |c| c.backend_type = BackendType::Server)
                    {
                        warn!(model = %config.name, error = %e, "Could not persist server backend");
                    }
                    return Ok(self.activate(handle, started));
                }
                Err(server_err) => {
                    warn!(model = %config.name, error = %server_err, "Server escalation failed");
                }
            }
        }

        self.count_failure(&config, &err);
        Err(err)
    }

    fn count_failure(&self, config: &ModelConfig, err: &LoadError) {
        let failures = self.ledger.record_failure(&config.name, &err.to_string());
        record_load_failure(&config.name, config.backend_type.as_str());
        warn!(model = %config.name, failures, error = %err, "Model load failed");
    }

    async fn bring_up(
        &self,
        config: &ModelConfig,
        backend: BackendType,
    ) -> Result<Arc<ProviderHandle>, LoadError> {
        if let Some(warm) = self.warmup.take(&config.name) {
            if warm.backend_type() == backend && warm.is_ready() {
                info!(model = %config.name, "Adopting warm handle");
                return Ok(warm);
            }
            warm.cleanup().await;
        }

        let handle = Arc::new(self.factory.build(config, backend));
        match handle.initialize().await {
            Ok(()) => Ok(handle),
            Err(e) => {
                handle.cleanup().await;
                Err(LoadError::from_init(&config.name, e))
            }
        }
    }

    fn activate(&self, handle: Arc<ProviderHandle>, started: Instant) -> Arc<ProviderHandle> {
        let name = handle.name().to_string();
        self.ledger.reset(&name);
        if let Err(e) = self.store.record_use(&name) {
            warn!(model = %name, error = %e, "Could not record model use");
        }
        if let Err(e) = self.store.set_active(&name) {
            warn!(model = %name, error = %e, "Could not persist active flag");
        }
        self.registry.install(Arc::clone(&handle));

        let backend = handle.backend_type().as_str();
        let elapsed = started.elapsed();
        record_load_success(&name, backend, elapsed);
        info!(model = %name, backend, elapsed_ms = elapsed.as_millis() as u64, "Model active");
        handle
    }

    async fn unload_current(&self) -> bool {
        let previous = self.registry.take();
        let had = previous.is_some();
        if let Some(handle) = previous {
            info!(model = %handle.name(), "Unloading active model");
            handle.cleanup().await;
        }
        if let Err(e) = self.store.clear_active() {
            warn!(error = %e, "Could not clear active flag");
        }
        had
    }

    /// Fill in a GPU layer estimate when the entry has none.
    fn ensure_gpu_estimate(&self, config: ModelConfig) -> ModelConfig {
        if config.gpu_layers().is_some() || config.backend_type == BackendType::RemoteApi {
            return config;
        }
        let layers = match estimate_for_file(&config.path, self.vram_tier) {
            Ok(n) => n,
            Err(e) => {
                warn!(model = %config.name, error = %e, "GPU layer estimate unavailable");
                return config;
            }
        };
        match self
            .store
            .update(&config.name, |c| c.set_param(param::GPU_LAYERS, layers))
        {
            Ok(updated) => updated,
            Err(e) => {
                warn!(model = %config.name, error = %e, "Could not persist GPU layer estimate");
                config.with_param(param::GPU_LAYERS, layers)
            }
        }
    }

    /// Unload the active model. Returns false when nothing was loaded.
    pub async fn unload(&self) -> bool {
        let _serial = self.load_lock.lock().await;
        self.unload_current().await
    }

    /// Clear the failure count for `name`.
    pub async fn reset_failures(&self, name: &str) {
        let _serial = self.load_lock.lock().await;
        self.ledger.reset(name);
    }

    /// Candidates for automatic recovery: `preferred` first, then by usage
    /// count, recency and name.
    pub fn rank_candidates(&self, preferred: Option<&str>) -> Vec<ModelConfig> {
        let preferred = preferred.map(name_key);
        let mut all = self.store.list();
        all.sort_by(|a, b| {
            let a_pref = preferred.as_deref() == Some(a.key().as_str());
            let b_pref = preferred.as_deref() == Some(b.key().as_str());
            b_pref
                .cmp(&a_pref)
                .then_with(|| b.usage_count.cmp(&a.usage_count))
                .then_with(|| b.last_used.cmp(&a.last_used))
                .then_with(|| a.name.cmp(&b.name))
        });
        all
    }

    /// Automatic recovery: try a bounded number of non-exhausted candidates
    /// and schedule the rest for background warm-up.
    pub async fn load_with_fallback(
        &self,
        preferred: Option<&str>,
    ) -> Result<Arc<ProviderHandle>, LoadError> {
        let _serial = self.load_lock.lock().await;
        let mut tried = Vec::new();
        let mut skipped = Vec::new();
        let mut remaining = Vec::new();

        for config in self.rank_candidates(preferred) {
            if self.ledger.is_exhausted(&config.name, self.options.max_load_attempts) {
                skipped.push(config.name);
                continue;
            }
            if tried.len() >= self.options.fallback_attempt_bound {
                remaining.push(config);
                continue;
            }
            tried.push(config.name.clone());
            match self.load_locked(&config.name).await {
                Ok(handle) => return Ok(handle),
                Err(e) => warn!(model = %config.name, error = %e, "Fallback candidate failed"),
            }
        }

        if !remaining.is_empty() {
            self.warmup.schedule(remaining);
        }
        Err(LoadError::NoCandidates { tried, skipped })
    }
}
