//! Shared fixtures: a scripted native backend and on-disk model stores.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gg_orchestrator::catalog::{BackendType, ConfigStore, ModelConfig};
use gg_orchestrator::config::OrchestratorConfig;
use gg_orchestrator::provider::{NativeBackend, NativeError, NativeModel, NativeParams, SamplingParams};
use gg_orchestrator::ModelRuntime;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Native backend whose load outcomes are scripted per call.
///
/// Scripted outcomes are consumed in order; once exhausted, loads succeed
/// unless the file name contains one of the failure markers.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<NativeError>>,
    fail_markers: Vec<String>,
    load_delay: Duration,
    loads: AtomicUsize,
    active_loads: AtomicUsize,
    max_concurrent_loads: AtomicUsize,
    last_sampling: Arc<Mutex<Option<SamplingParams>>>,
    loaded_params: Mutex<Vec<NativeParams>>,
}

impl ScriptedBackend {
    pub fn always_ok() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(outcomes: Vec<NativeError>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            fail_markers: Vec::new(),
            load_delay: Duration::ZERO,
            loads: AtomicUsize::new(0),
            active_loads: AtomicUsize::new(0),
            max_concurrent_loads: AtomicUsize::new(0),
            last_sampling: Arc::new(Mutex::new(None)),
            loaded_params: Mutex::new(Vec::new()),
        }
    }

    /// Loads of files whose name contains `marker` fail with a runtime error.
    pub fn failing_for(mut self, marker: &str) -> Self {
        self.fail_markers.push(marker.to_string());
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_loads(&self) -> usize {
        self.max_concurrent_loads.load(Ordering::SeqCst)
    }

    pub fn last_sampling(&self) -> Option<SamplingParams> {
        self.last_sampling.lock().clone()
    }

    pub fn loaded_params(&self) -> Vec<NativeParams> {
        self.loaded_params.lock().clone()
    }
}

impl NativeBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn load(&self, path: &Path, params: &NativeParams) -> Result<Arc<dyn NativeModel>, NativeError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let now = self.active_loads.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_loads.fetch_max(now, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        self.active_loads.fetch_sub(1, Ordering::SeqCst);
        self.loaded_params.lock().push(params.clone());

        if let Some(err) = self.script.lock().pop_front() {
            return Err(err);
        }
        let file = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if self.fail_markers.iter().any(|m| file.contains(m.as_str())) {
            return Err(NativeError::Runtime(format!("cannot load {file}")));
        }
        Ok(Arc::new(EchoModel {
            file,
            last_sampling: Arc::clone(&self.last_sampling),
        }))
    }
}

/// Replies `"<file>: <prompt>"`. Prompts containing "slow" run until
/// cancelled or five seconds pass.
struct EchoModel {
    file: String,
    last_sampling: Arc<Mutex<Option<SamplingParams>>>,
}

impl NativeModel for EchoModel {
    fn generate(
        &self,
        prompt: &str,
        sampling: &SamplingParams,
        cancel: &CancellationToken,
    ) -> Result<String, NativeError> {
        *self.last_sampling.lock() = Some(sampling.clone());
        if prompt.contains("slow") {
            for _ in 0..500 {
                if cancel.is_cancelled() {
                    return Ok(String::new());
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        Ok(format!("{}: {prompt}", self.file))
    }
}

/// Write a small fake model file.
pub fn model_file(dir: &Path, file_name: &str) -> PathBuf {
    let path = dir.join(file_name);
    std::fs::write(&path, b"GGUF\x03\x00\x00\x00fake weights").unwrap();
    path
}

/// Defaults with the config dir under `root`, no server escalation and
/// quick server timeouts.
pub fn test_config(root: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.store.config_dir = root.join("configs");
    config.loading.allow_server_escalation = false;
    config.server.health_interval = Duration::from_millis(20);
    config.server.health_attempts = 3;
    config.server.probe_timeout = Duration::from_millis(200);
    config.server.terminate_timeout = Duration::from_secs(2);
    config.server.port = unused_port();
    config
}

/// Save one direct-backend config per `(name, file_name)` pair.
pub fn seed_store(root: &Path, models: &[(&str, &str)]) {
    let store = ConfigStore::open(root.join("configs")).unwrap();
    for (name, file_name) in models {
        let path = model_file(root, file_name);
        store.save(ModelConfig::new(*name, path, BackendType::Direct)).unwrap();
    }
}

pub fn runtime(config: OrchestratorConfig, backend: Arc<ScriptedBackend>) -> ModelRuntime {
    ModelRuntime::with_native_backend(config, backend).unwrap()
}

pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
