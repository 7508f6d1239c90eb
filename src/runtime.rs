//! Caller-facing façade over the catalog, orchestrator and active provider.
//!
//! Operations here never return errors to the caller; failures become a
//! `false` or one of the stable messages below, and are logged.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{scan, ConfigStore, DiscoveryOptions, ModelConfig, StoreError};
use crate::config::OrchestratorConfig;
use crate::models::{
    ActiveModelRegistry, FailureLedger, LoadError, LoadOrchestrator, PreloadFailure, WarmupPool,
};
use crate::provider::{
    default_native_backend, GenerationParams, NativeBackend, ProviderFactory, ProviderHandle,
};
use crate::supervisor::OrphanGuard;

pub const NO_MODEL_LOADED: &str = "Error: No model loaded. Please load a model first.";
pub const GENERATION_FAILED_PREFIX: &str = "Error generating response: ";

pub struct ModelRuntime {
    config: Arc<OrchestratorConfig>,
    store: Arc<ConfigStore>,
    registry: Arc<ActiveModelRegistry>,
    ledger: Arc<FailureLedger>,
    orchestrator: LoadOrchestrator,
    guard: Arc<OrphanGuard>,
}

impl ModelRuntime {
    /// Open the config store and wire the orchestrator with the native
    /// backend compiled into this build.
    pub fn new(config: OrchestratorConfig) -> Result<Self, StoreError> {
        Self::with_native_backend(config, default_native_backend())
    }

    pub fn with_native_backend(
        config: OrchestratorConfig,
        native: Arc<dyn NativeBackend>,
    ) -> Result<Self, StoreError> {
        let config = Arc::new(config);
        let store = Arc::new(ConfigStore::open(&config.store.config_dir)?);
        let guard = OrphanGuard::global();
        let registry = Arc::new(ActiveModelRegistry::new());
        let ledger = Arc::new(FailureLedger::new());
        let factory = ProviderFactory::new(native, Arc::clone(&config), Arc::clone(&guard));
        let warmup = Arc::new(WarmupPool::new(
            factory.clone(),
            config.loading.warmup_capacity,
            config.loading.preload_error_capacity,
        ));
        let orchestrator = LoadOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&ledger),
            factory,
            warmup,
            config.loading.clone(),
            config.vram_tier,
        );

        let quarantined = store.quarantined().len();
        info!(
            models = store.len(),
            quarantined,
            config_dir = %config.store.config_dir.display(),
            "Model runtime ready"
        );
        Ok(Self {
            config,
            store,
            registry,
            ledger,
            orchestrator,
            guard,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
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

    pub fn orchestrator(&self) -> &LoadOrchestrator {
        &self.orchestrator
    }

    /// Register the orphan guard's exit handlers.
    pub fn install_exit_handlers(&self) {
        self.guard.install();
    }

    /// Typed variant of [`Self::load_model`].
    pub async fn try_load(&self, name: &str) -> Result<Arc<ProviderHandle>, LoadError> {
        self.orchestrator.load(name).await
    }

    pub async fn load_model(&self, name: &str) -> bool {
        match self.orchestrator.load(name).await {
            Ok(_) => true,
            Err(e) => {
                warn!(model = %name, error = %e, "load_model failed");
                false
            }
        }
    }

    pub async fn unload_model(&self) -> bool {
        self.orchestrator.unload().await
    }

    /// Reload the previously active model, falling back to other entries.
    pub async fn recover(&self) -> bool {
        let preferred = self.store.active().map(|c| c.name);
        match self.orchestrator.load_with_fallback(preferred.as_deref()).await {
            Ok(handle) => {
                info!(model = %handle.name(), "Recovered active model");
                true
            }
            Err(e) => {
                warn!(error = %e, "Recovery found no loadable model");
                false
            }
        }
    }

    pub async fn generate(&self, prompt: &str, params: &GenerationParams) -> String {
        self.generate_with_cancel(prompt, params, CancellationToken::new())
            .await
    }

    pub async fn generate_with_cancel(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> String {
        let Some(handle) = self.registry.snapshot() else {
            return NO_MODEL_LOADED.to_string();
        };
        match handle.generate(prompt, params, cancel).await {
            Ok(text) => text,
            Err(e) => {
                warn!(model = %handle.name(), error = %e, "Generation failed");
                format!("{GENERATION_FAILED_PREFIX}{e}")
            }
        }
    }

    /// The stored config of the active model, read fresh from the store.
    pub fn get_active_model(&self) -> Option<ModelConfig> {
        let name = self.registry.active_name()?;
        self.store.get(&name).ok().or_else(|| self.registry.active_config())
    }

    pub fn list_models(&self) -> Vec<ModelConfig> {
        self.store.list()
    }

    /// Discover models under `roots` and add new ones to the store.
    /// Returns the names that were added.
    pub fn scan(&self, roots: &[PathBuf]) -> Vec<String> {
        let options = DiscoveryOptions {
            min_size_bytes: self.config.discovery.min_size_bytes,
            vram_tier: self.config.vram_tier,
            ..DiscoveryOptions::default()
        };
        let found = scan(roots, &options);
        match self.store.merge_discovered(found) {
            Ok(added) => {
                let names: Vec<String> = added.into_iter().map(|c| c.name).collect();
                info!(added = names.len(), "Discovery merged");
                names
            }
            Err(e) => {
                warn!(error = %e, "Could not merge discovered models");
                Vec::new()
            }
        }
    }

    /// Scan the configured discovery roots.
    pub fn scan_configured(&self) -> Vec<String> {
        let roots = self.config.discovery.roots.clone();
        self.scan(&roots)
    }

    pub async fn reset_failures(&self, name: &str) {
        self.orchestrator.reset_failures(name).await
    }

    pub fn preload_errors(&self) -> Vec<PreloadFailure> {
        self.orchestrator.warmup().errors()
    }

    /// Unload the active model and release warm handles.
    pub async fn shutdown(&self) {
        self.orchestrator.warmup().clear().await;
        self.orchestrator.unload().await;
        info!("Model runtime shut down");
    }
}
