//! Seam between the direct provider and an in-process inference library.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NativeError {
    /// The library rejected the parameter set (context, batch, offload).
    #[error("Native assertion failed: {0}")]
    Assertion(String),

    #[error("Native library unavailable: {0}")]
    Unavailable(String),

    #[error("Native runtime error: {0}")]
    Runtime(String),
}

/// Parameters fixed at model load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NativeParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_gpu_layers: u32,
    /// 0 means pick from the host CPU count.
    pub n_threads: u32,
}

/// Per-call sampling parameters, deserialized from the direct dialect.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub repetition_penalty: Option<f32>,
    pub repeat_last_n: Option<u32>,
    pub min_p: Option<f32>,
    pub stop: Vec<String>,
}

/// A model loaded into the native library.
pub trait NativeModel: Send + Sync {
    /// Blocking completion. Implementations should poll `cancel` between
    /// tokens and stop early once it fires.
    fn generate(
        &self,
        prompt: &str,
        sampling: &SamplingParams,
        cancel: &CancellationToken,
    ) -> Result<String, NativeError>;
}

/// Loader for an in-process inference library.
pub trait NativeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Blocking load of the model at `path` with `params`.
    fn load(&self, path: &Path, params: &NativeParams) -> Result<Arc<dyn NativeModel>, NativeError>;
}

/// Stand-in used when no native library was compiled in.
pub struct UnavailableBackend;

impl NativeBackend for UnavailableBackend {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn load(&self, _path: &Path, _params: &NativeParams) -> Result<Arc<dyn NativeModel>, NativeError> {
        Err(NativeError::Unavailable(
            "built without the `gguf` feature".to_string(),
        ))
    }
}

/// The native backend compiled into this build.
pub fn default_native_backend() -> Arc<dyn NativeBackend> {
    #[cfg(feature = "gguf")]
    {
        Arc::new(super::llama::LlamaCppBackend)
    }
    #[cfg(not(feature = "gguf"))]
    {
        Arc::new(UnavailableBackend)
    }
}

/// Resolve a thread count, `0` meaning auto.
pub fn resolve_threads(n: u32) -> i32 {
    if n == 0 {
        // Inference is memory-bound; past 16 threads returns diminish.
        let optimal = num_cpus::get().clamp(1, 16);
        i32::try_from(optimal).unwrap_or(4)
    } else {
        i32::try_from(n).unwrap_or(4)
    }
}
