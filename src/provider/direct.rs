//! In-process provider backed by a [`NativeBackend`].
//!
//! Initialization walks an ordered ladder of parameter sets, each more
//! conservative than the last, advancing only on assertion-class failures.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::{GenError, InitError};
use super::flight::FlightTracker;
use super::native::{NativeBackend, NativeError, NativeModel, NativeParams, SamplingParams};
use super::params::{Dialect, GenerationParams};
use super::{ProviderState, StateCell};
use crate::catalog::{ModelConfig, ModelFormat, DEFAULT_BATCH_SIZE};
use crate::config::DirectConfig;

const REDUCED_CONTEXT: u32 = 2048;
const REDUCED_BATCH: u32 = 256;
/// Grace given to in-flight calls before they are cancelled at cleanup.
const CLEANUP_GRACE: Duration = Duration::from_secs(2);

/// Initial load parameters derived from a model config.
pub fn initial_params(config: &ModelConfig, n_threads: u32) -> NativeParams {
    NativeParams {
        n_ctx: config.context_size(),
        n_batch: config.batch_size().unwrap_or(DEFAULT_BATCH_SIZE),
        n_gpu_layers: config.gpu_layers().unwrap_or(0),
        n_threads,
    }
}

/// The initial set followed by cumulative fallbacks: reduced context, then
/// reduced batch, then GPU offload disabled. Repeated sets are collapsed.
pub fn fallback_param_sets(initial: &NativeParams) -> Vec<NativeParams> {
    let reduced_ctx = NativeParams {
        n_ctx: initial.n_ctx.min(REDUCED_CONTEXT),
        ..initial.clone()
    };
    let reduced_batch = NativeParams {
        n_batch: reduced_ctx.n_batch.min(REDUCED_BATCH),
        ..reduced_ctx.clone()
    };
    let cpu_only = NativeParams {
        n_gpu_layers: 0,
        ..reduced_batch.clone()
    };

    let mut sets: Vec<NativeParams> = vec![initial.clone()];
    for set in [reduced_ctx, reduced_batch, cpu_only] {
        if sets.last() != Some(&set) {
            sets.push(set);
        }
    }
    sets
}

pub struct DirectProvider {
    config: ModelConfig,
    backend: Arc<dyn NativeBackend>,
    options: DirectConfig,
    state: StateCell,
    model: RwLock<Option<Arc<dyn NativeModel>>>,
    attempted: RwLock<Vec<NativeParams>>,
    loaded_with: RwLock<Option<NativeParams>>,
    init_lock: tokio::sync::Mutex<()>,
    flights: FlightTracker,
    shutdown: RwLock<CancellationToken>,
}

impl DirectProvider {
    pub fn new(config: ModelConfig, backend: Arc<dyn NativeBackend>, options: DirectConfig) -> Self {
        Self {
            config,
            backend,
            options,
            state: StateCell::new(),
            model: RwLock::new(None),
            attempted: RwLock::new(Vec::new()),
            loaded_with: RwLock::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            flights: FlightTracker::new(),
            shutdown: RwLock::new(CancellationToken::new()),
        }
    }

    pub fn state(&self) -> ProviderState {
        self.state.get()
    }

    /// Generations currently holding a flight guard.
    pub fn in_flight(&self) -> u32 {
        self.flights.in_flight_count()
    }

    /// Parameter sets tried by the last initialization, in order.
    pub fn attempted_params(&self) -> Vec<NativeParams> {
        self.attempted.read().clone()
    }

    /// Parameter set the model is currently loaded with.
    pub fn loaded_params(&self) -> Option<NativeParams> {
        self.loaded_with.read().clone()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
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
        let path = self.config.path.clone();
        if !path.is_file() {
            return Err(InitError::ModelFileMissing(path));
        }
        if !matches!(self.config.format, ModelFormat::Unknown) && !self.config.format.is_llama_native() {
            return Err(InitError::BackendUnavailable(format!(
                "{} cannot open {} artifacts",
                self.backend.name(),
                self.config.format.as_str()
            )));
        }

        let sets = fallback_param_sets(&initial_params(&self.config, self.options.n_threads));
        self.attempted.write().clear();
        let mut last_error = String::new();

        for (i, params) in sets.iter().enumerate() {
            self.attempted.write().push(params.clone());
            let backend = self.backend.clone();
            let load_path = path.clone();
            let load_params = params.clone();
            let joined =
                tokio::task::spawn_blocking(move || backend.load(&load_path, &load_params)).await;

            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(NativeError::Runtime(format!("load task failed: {e}"))),
            };

            match result {
                Ok(model) => {
                    info!(
                        model = %self.config.name,
                        attempt = i + 1,
                        n_ctx = params.n_ctx,
                        n_batch = params.n_batch,
                        n_gpu_layers = params.n_gpu_layers,
                        "Direct backend loaded"
                    );
                    *self.model.write() = Some(model);
                    *self.loaded_with.write() = Some(params.clone());
                    return Ok(());
                }
                Err(NativeError::Assertion(msg)) => {
                    warn!(
                        model = %self.config.name,
                        attempt = i + 1,
                        remaining = sets.len() - i - 1,
                        error = %msg,
                        "Native library rejected parameters, trying fallback set"
                    );
                    last_error = msg;
                }
                Err(NativeError::Unavailable(msg)) => {
                    return Err(InitError::BackendUnavailable(msg));
                }
                Err(NativeError::Runtime(msg)) => {
                    return Err(InitError::InitializationFailure { attempts: i + 1, last_error: msg });
                }
            }
        }

        Err(InitError::InitializationFailure { attempts: sets.len(), last_error })
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<String, GenError> {
        // Registered before the state check so a concurrent cleanup drains it.
        let _flight = self.flights.track();
        let state = self.state.get();
        if state != ProviderState::Ready {
            return Err(GenError::NotReady(state));
        }
        let model = self
            .model
            .read()
            .clone()
            .ok_or(GenError::NotReady(ProviderState::Unloaded))?;

        let wire = Dialect::Direct.translate(&params.resolve(&self.config));
        let sampling: SamplingParams = serde_json::from_value(serde_json::Value::Object(wire))
            .map_err(|e| GenError::Generation(format!("sampling params: {e}")))?;

        // Child token so both the caller and cleanup can stop the native loop.
        let stop = self.shutdown.read().child_token();
        let native_stop = stop.clone();
        let prompt = prompt.to_string();
        let task = tokio::task::spawn_blocking(move || model.generate(&prompt, &sampling, &native_stop));

        let timeout = self.options.generation_timeout;
        let outcome = tokio::select! {
            joined = tokio::time::timeout(timeout, task) => joined,
            _ = cancel.cancelled() => {
                stop.cancel();
                return Err(GenError::Cancelled);
            }
            _ = stop.cancelled() => return Err(GenError::Cancelled),
        };

        match outcome {
            Err(_) => {
                stop.cancel();
                Err(GenError::Timeout(timeout))
            }
            Ok(Err(join)) => Err(GenError::Generation(format!("generation task failed: {join}"))),
            Ok(Ok(Err(e))) => Err(GenError::Generation(e.to_string())),
            Ok(Ok(Ok(text))) => Ok(text),
        }
    }

    /// Release the native model. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let _init = self.init_lock.lock().await;
        if matches!(self.state.get(), ProviderState::Unloaded | ProviderState::Uninitialized) {
            return;
        }
        self.state.set(ProviderState::Unloaded);

        if self.flights.drain(CLEANUP_GRACE).await.is_err() {
            self.shutdown.read().cancel();
            let _ = self.flights.drain(CLEANUP_GRACE).await;
        }
        self.model.write().take();
        self.loaded_with.write().take();
        info!(model = %self.config.name, "Direct backend released");
    }
}
