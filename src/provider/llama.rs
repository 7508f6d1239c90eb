//! llama-cpp-2 implementation of the native backend.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use tokio_util::sync::CancellationToken;

use super::native::{resolve_threads, NativeBackend, NativeError, NativeModel, NativeParams, SamplingParams};
use crate::catalog::{DEFAULT_REPEAT_LAST_N, DEFAULT_REPETITION_PENALTY, DEFAULT_TEMPERATURE, DEFAULT_TOP_P};

/// llama.cpp may only be initialized once per process.
static BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();

fn backend() -> Result<&'static LlamaBackend, NativeError> {
    BACKEND
        .get_or_init(|| LlamaBackend::init().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| NativeError::Unavailable(format!("backend init: {e}")))
}

pub struct LlamaCppBackend;

impl NativeBackend for LlamaCppBackend {
    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    fn load(&self, path: &Path, params: &NativeParams) -> Result<Arc<dyn NativeModel>, NativeError> {
        let backend = backend()?;
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.n_gpu_layers);
        // A null model means llama.cpp rejected the offload or file.
        let model = LlamaModel::load_from_file(backend, path, &model_params)
            .map_err(|e| NativeError::Assertion(format!("load: {e}")))?;

        let loaded = LlamaLoaded {
            backend,
            model,
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            n_threads: resolve_threads(params.n_threads),
        };
        // Probe the context once so bad n_ctx/n_batch fail at load, not mid-chat.
        loaded.create_context()?;
        Ok(Arc::new(loaded))
    }
}

struct LlamaLoaded {
    backend: &'static LlamaBackend,
    model: LlamaModel,
    n_ctx: u32,
    n_batch: u32,
    n_threads: i32,
}

// SAFETY: LlamaModel is immutable after load; contexts are created per call.
unsafe impl Send for LlamaLoaded {}
unsafe impl Sync for LlamaLoaded {}

impl LlamaLoaded {
    fn create_context(&self) -> Result<LlamaContext<'_>, NativeError> {
        let p = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.n_ctx))
            .with_n_batch(self.n_batch)
            .with_n_threads(self.n_threads)
            .with_n_threads_batch(self.n_threads);
        self.model
            .new_context(self.backend, p)
            .map_err(|e| NativeError::Assertion(format!("ctx: {e}")))
    }

    fn tokenize(&self, text: &str) -> Result<Vec<LlamaToken>, NativeError> {
        self.model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| NativeError::Runtime(format!("tokenize: {e}")))
    }

    fn piece(&self, tok: LlamaToken, dec: &mut encoding_rs::Decoder) -> Result<String, NativeError> {
        self.model
            .token_to_piece(tok, dec, false, None)
            .map_err(|e| NativeError::Runtime(format!("detok: {e}")))
    }
}

impl NativeModel for LlamaLoaded {
    fn generate(
        &self,
        prompt: &str,
        sampling: &SamplingParams,
        cancel: &CancellationToken,
    ) -> Result<String, NativeError> {
        let tokens = self.tokenize(prompt)?;
        if tokens.len() >= self.n_ctx as usize {
            return Err(NativeError::Runtime(format!(
                "prompt is {} tokens, context is {}",
                tokens.len(),
                self.n_ctx
            )));
        }
        let max_tok = sampling.max_tokens.unwrap_or(super::params::DEFAULT_MAX_TOKENS);
        let mut ctx = self.create_context()?;

        let mut batch = LlamaBatch::new(tokens.len().max(self.n_batch as usize), 1);
        add_seq(&mut batch, &tokens)?;
        decode(&mut ctx, &mut batch)?;

        let mut sampler = build_sampler(sampling);
        sampler.accept_many(tokens.iter().copied());

        let mut dec = encoding_rs::UTF_8.new_decoder();
        let mut out = String::new();
        let mut pos = tokens.len() as i32;
        for _ in 0..max_tok {
            if cancel.is_cancelled() {
                break;
            }
            let tok = sampler.sample(&ctx, -1);
            sampler.accept(tok);
            if self.model.is_eog_token(tok) {
                break;
            }
            out.push_str(&self.piece(tok, &mut dec)?);
            if let Some(cut) = stop_index(&out, &sampling.stop) {
                out.truncate(cut);
                break;
            }
            if pos as u32 + 1 >= self.n_ctx {
                break;
            }
            batch.clear();
            add_one(&mut batch, tok, pos)?;
            decode(&mut ctx, &mut batch)?;
            pos += 1;
        }
        Ok(out)
    }
}

fn stop_index(text: &str, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}

fn add_seq(batch: &mut LlamaBatch, tokens: &[LlamaToken]) -> Result<(), NativeError> {
    let n = tokens.len();
    for (i, &tok) in tokens.iter().enumerate() {
        // Only the last prompt token needs logits.
        batch
            .add(tok, i as i32, &[0], i + 1 == n)
            .map_err(|e| NativeError::Runtime(format!("batch: {e}")))?;
    }
    Ok(())
}

fn add_one(batch: &mut LlamaBatch, tok: LlamaToken, pos: i32) -> Result<(), NativeError> {
    batch
        .add(tok, pos, &[0], true)
        .map_err(|e| NativeError::Runtime(format!("batch: {e}")))
}

fn decode(ctx: &mut LlamaContext<'_>, batch: &mut LlamaBatch) -> Result<(), NativeError> {
    ctx.decode(batch)
        .map_err(|e| NativeError::Runtime(format!("decode: {e}")))
}

fn build_sampler(sampling: &SamplingParams) -> LlamaSampler {
    let mut s = Vec::new();
    let penalty = sampling.repetition_penalty.unwrap_or(DEFAULT_REPETITION_PENALTY);
    if penalty > 1.0 {
        let window = sampling.repeat_last_n.unwrap_or(DEFAULT_REPEAT_LAST_N);
        s.push(LlamaSampler::penalties(i32::try_from(window).unwrap_or(i32::MAX), penalty, 0.0, 0.0));
    }
    if let Some(k) = sampling.top_k.filter(|k| *k > 0) {
        s.push(LlamaSampler::top_k(i32::try_from(k).unwrap_or(i32::MAX)));
    }
    s.push(LlamaSampler::top_p(sampling.top_p.unwrap_or(DEFAULT_TOP_P), 1));
    if let Some(p) = sampling.min_p.filter(|p| *p > 0.0) {
        s.push(LlamaSampler::min_p(p, 1));
    }
    s.push(LlamaSampler::temp(sampling.temperature.unwrap_or(DEFAULT_TEMPERATURE)));
    s.push(LlamaSampler::dist(42));
    LlamaSampler::chain_simple(s)
}
