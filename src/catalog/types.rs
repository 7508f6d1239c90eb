//! Model descriptor types persisted by the config store.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend used to execute a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// In-process native library.
    #[default]
    Direct,
    /// Local llama-server subprocess over HTTP.
    Server,
    /// Hosted OpenAI-compatible endpoint.
    RemoteApi,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Server => "server",
            Self::RemoteApi => "remote_api",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk artifact format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    Gguf,
    Ggml,
    Safetensors,
    Pytorch,
    /// Directory-based checkpoint with a sibling `config.json`.
    HfDirectory,
    #[default]
    Unknown,
}

impl ModelFormat {
    /// Formats llama.cpp can open.
    pub fn is_llama_native(&self) -> bool {
        matches!(self, Self::Gguf | Self::Ggml)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gguf => "gguf",
            Self::Ggml => "ggml",
            Self::Safetensors => "safetensors",
            Self::Pytorch => "pytorch",
            Self::HfDirectory => "hf_directory",
            Self::Unknown => "unknown",
        }
    }
}

/// Prompt template a model expects.
///
/// Persisted as a plain string; unrecognized ids survive as `Other`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChatFormat {
    /// Neutral template; backends apply their own detection.
    #[default]
    Default,
    Llama3,
    Llama2,
    ChatMl,
    Mistral,
    Vicuna,
    Alpaca,
    Gemma,
    OpenChat,
    Other(String),
}

impl ChatFormat {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Default => "default",
            Self::Llama3 => "llama-3",
            Self::Llama2 => "llama-2",
            Self::ChatMl => "chatml",
            Self::Mistral => "mistral",
            Self::Vicuna => "vicuna",
            Self::Alpaca => "alpaca",
            Self::Gemma => "gemma",
            Self::OpenChat => "openchat",
            Self::Other(s) => s,
        }
    }

    /// Built-in template name accepted by `llama-server --chat-template`.
    pub fn server_template(&self) -> Option<&str> {
        match self {
            Self::Llama3 => Some("llama3"),
            Self::Llama2 => Some("llama2"),
            Self::ChatMl => Some("chatml"),
            Self::Mistral => Some("mistral-v1"),
            Self::Vicuna => Some("vicuna"),
            Self::Gemma => Some("gemma"),
            Self::OpenChat => Some("openchat"),
            Self::Alpaca | Self::Default => None,
            Self::Other(s) => Some(s),
        }
    }
}

impl From<String> for ChatFormat {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Self::Default,
            "llama-3" | "llama3" => Self::Llama3,
            "llama-2" | "llama2" => Self::Llama2,
            "chatml" | "chat-ml" => Self::ChatMl,
            "mistral" => Self::Mistral,
            "vicuna" => Self::Vicuna,
            "alpaca" => Self::Alpaca,
            "gemma" => Self::Gemma,
            "openchat" => Self::OpenChat,
            _ => Self::Other(s),
        }
    }
}

impl From<ChatFormat> for String {
    fn from(f: ChatFormat) -> Self {
        f.as_str().to_string()
    }
}

impl fmt::Display for ChatFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar value in a model's parameter map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            Self::Float(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Well-known keys in [`ModelConfig::parameters`].
pub mod param {
    pub const CONTEXT_SIZE: &str = "context_size";
    pub const GPU_LAYERS: &str = "gpu_layers";
    pub const BATCH_SIZE: &str = "batch_size";
    pub const TEMPERATURE: &str = "temperature";
    pub const TOP_P: &str = "top_p";
    pub const TOP_K: &str = "top_k";
    pub const MIN_P: &str = "min_p";
    pub const REPETITION_PENALTY: &str = "repetition_penalty";
    pub const REPEAT_LAST_N: &str = "repeat_last_n";
    pub const MAX_TOKENS: &str = "max_tokens";
    pub const NUM_EXPERTS: &str = "num_experts";
    pub const SMOOTHING_FACTOR: &str = "smoothing_factor";
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const API_KEY_ENV: &str = "api_key_env";
    pub const BASE_URL: &str = "base_url";
    pub const REMOTE_MODEL: &str = "remote_model";
    pub const ALLOW_SERVER_FALLBACK: &str = "allow_server_fallback";
}

pub const DEFAULT_CONTEXT_SIZE: u32 = 4096;
pub const DEFAULT_BATCH_SIZE: u32 = 512;
pub const DEFAULT_TEMPERATURE: f32 = 0.8;
pub const DEFAULT_TOP_P: f32 = 0.95;
pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_REPETITION_PENALTY: f32 = 1.06;
pub const DEFAULT_MIN_P: f32 = 0.05;
pub const DEFAULT_REPEAT_LAST_N: u32 = 64;

/// Identity and tuning record for one model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub backend_type: BackendType,
    #[serde(default)]
    pub format: ModelFormat,
    #[serde(default)]
    pub chat_format: ChatFormat,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Case-insensitive store key for a model name.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Replace Windows separators so the same artifact always compares equal.
pub fn normalize_path(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if text.contains('\\') {
        PathBuf::from(text.replace('\\', "/"))
    } else {
        path.to_path_buf()
    }
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, backend_type: BackendType) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            backend_type,
            format: ModelFormat::Unknown,
            chat_format: ChatFormat::Default,
            parameters: BTreeMap::new(),
            active: false,
            usage_count: 0,
            last_used: None,
            description: None,
        }
    }

    pub fn key(&self) -> String {
        name_key(&self.name)
    }

    /// The model file exists and is a regular file. Remote entries have
    /// no local artifact.
    pub fn is_loadable(&self) -> bool {
        self.backend_type == BackendType::RemoteApi || self.path.is_file()
    }

    pub fn with_param(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.set_param(key, value);
        self
    }

    pub fn set_param(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.parameters.insert(key.to_string(), value.into());
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.parameters.get(key)
    }

    pub fn param_u32(&self, key: &str) -> Option<u32> {
        self.param(key)
            .and_then(ParamValue::as_i64)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub fn param_f32(&self, key: &str) -> Option<f32> {
        self.param(key).and_then(ParamValue::as_f64).map(|v| v as f32)
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.param(key).and_then(ParamValue::as_bool)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(ParamValue::as_str)
    }

    pub fn context_size(&self) -> u32 {
        self.param_u32(param::CONTEXT_SIZE).unwrap_or(DEFAULT_CONTEXT_SIZE)
    }

    pub fn gpu_layers(&self) -> Option<u32> {
        self.param_u32(param::GPU_LAYERS)
    }

    pub fn batch_size(&self) -> Option<u32> {
        self.param_u32(param::BATCH_SIZE)
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.param_u32(param::MAX_TOKENS)
    }

    pub fn temperature(&self) -> f32 {
        self.param_f32(param::TEMPERATURE).unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn top_p(&self) -> f32 {
        self.param_f32(param::TOP_P).unwrap_or(DEFAULT_TOP_P)
    }

    pub fn top_k(&self) -> u32 {
        self.param_u32(param::TOP_K).unwrap_or(DEFAULT_TOP_K)
    }

    pub fn repetition_penalty(&self) -> f32 {
        self.param_f32(param::REPETITION_PENALTY)
            .unwrap_or(DEFAULT_REPETITION_PENALTY)
    }

    pub fn min_p(&self) -> f32 {
        self.param_f32(param::MIN_P).unwrap_or(DEFAULT_MIN_P)
    }

    /// Window the repetition penalty looks back over, in tokens.
    pub fn repeat_last_n(&self) -> u32 {
        self.param_u32(param::REPEAT_LAST_N).unwrap_or(DEFAULT_REPEAT_LAST_N)
    }

    /// Whether a failed direct load may escalate to the server backend.
    pub fn allows_server_fallback(&self) -> bool {
        self.param_bool(param::ALLOW_SERVER_FALLBACK).unwrap_or(true)
    }

    /// Fill mixture-of-experts tuning derivable from the name.
    pub fn apply_family_defaults(&mut self) {
        let hints = crate::sizing::NameHints::parse(&self.name);
        let file_hints = self
            .path
            .file_name()
            .map(|n| crate::sizing::NameHints::parse(&n.to_string_lossy()))
            .unwrap_or_default();
        if !(hints.moe || file_hints.moe) {
            return;
        }

        if !self.parameters.contains_key(param::NUM_EXPERTS) {
            let experts = crate::sizing::expert_count(&self.name).or_else(|| {
                self.path
                    .file_name()
                    .and_then(|n| crate::sizing::expert_count(&n.to_string_lossy()))
            });
            if let Some(n) = experts {
                self.set_param(param::NUM_EXPERTS, n);
            }
        }
        self.parameters
            .entry(param::SMOOTHING_FACTOR.to_string())
            .or_insert(ParamValue::Float(1.5));
    }
}
