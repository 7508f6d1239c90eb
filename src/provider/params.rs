//! Backend-neutral generation parameters and per-backend translation.
//!
//! Callers speak one vocabulary ([`GenerationParams`]). Each [`Dialect`]
//! declares the neutral fields it consumes and the wire names it emits;
//! anything not consumed is dropped.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::catalog::ModelConfig;

/// Token budget used by the in-process backend when the caller sets none.
pub const DEFAULT_MAX_TOKENS: u32 = 256;
/// Token budget for llama-server requests when the caller sets none.
pub const SERVER_DEFAULT_MAX_TOKENS: u32 = 512;

/// Generation parameters in the neutral vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub repetition_penalty: Option<f32>,
    pub repeat_last_n: Option<u32>,
    pub min_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub stop: Vec<String>,
    pub system_prompt: Option<String>,
}

/// One field of [`GenerationParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NeutralField {
    MaxTokens,
    Temperature,
    TopP,
    TopK,
    RepetitionPenalty,
    RepeatLastN,
    MinP,
    PresencePenalty,
    FrequencyPenalty,
    Stop,
    SystemPrompt,
}

impl NeutralField {
    pub const ALL: [NeutralField; 11] = [
        Self::MaxTokens,
        Self::Temperature,
        Self::TopP,
        Self::TopK,
        Self::RepetitionPenalty,
        Self::RepeatLastN,
        Self::MinP,
        Self::PresencePenalty,
        Self::FrequencyPenalty,
        Self::Stop,
        Self::SystemPrompt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::MaxTokens => "max_tokens",
            Self::Temperature => "temperature",
            Self::TopP => "top_p",
            Self::TopK => "top_k",
            Self::RepetitionPenalty => "repetition_penalty",
            Self::RepeatLastN => "repeat_last_n",
            Self::MinP => "min_p",
            Self::PresencePenalty => "presence_penalty",
            Self::FrequencyPenalty => "frequency_penalty",
            Self::Stop => "stop",
            Self::SystemPrompt => "system_prompt",
        }
    }
}

impl GenerationParams {
    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    /// Neutral value of `field` as JSON, or `None` when unset.
    pub fn value(&self, field: NeutralField) -> Option<Value> {
        match field {
            NeutralField::MaxTokens => self.max_tokens.map(Value::from),
            NeutralField::Temperature => self.temperature.map(Value::from),
            NeutralField::TopP => self.top_p.map(Value::from),
            NeutralField::TopK => self.top_k.map(Value::from),
            NeutralField::RepetitionPenalty => self.repetition_penalty.map(Value::from),
            NeutralField::RepeatLastN => self.repeat_last_n.map(Value::from),
            NeutralField::MinP => self.min_p.map(Value::from),
            NeutralField::PresencePenalty => self.presence_penalty.map(Value::from),
            NeutralField::FrequencyPenalty => self.frequency_penalty.map(Value::from),
            NeutralField::Stop => (!self.stop.is_empty()).then(|| json!(self.stop)),
            NeutralField::SystemPrompt => self.system_prompt.clone().map(Value::from),
        }
    }

    /// Fill unset sampling fields from the model, which falls back to the
    /// catalog defaults for anything it does not store.
    ///
    /// `max_tokens` has no catalog default so each dialect applies its own.
    pub fn resolve(&self, model: &ModelConfig) -> GenerationParams {
        let mut out = self.clone();
        out.max_tokens = out.max_tokens.or_else(|| model.max_tokens());
        out.temperature = out.temperature.or(Some(model.temperature()));
        out.top_p = out.top_p.or(Some(model.top_p()));
        out.top_k = out.top_k.or(Some(model.top_k()));
        out.repetition_penalty = out.repetition_penalty.or(Some(model.repetition_penalty()));
        out.repeat_last_n = out.repeat_last_n.or(Some(model.repeat_last_n()));
        out.min_p = out.min_p.or(Some(model.min_p()));
        out
    }
}

/// Wire vocabulary of one backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// In-process native library.
    Direct,
    /// llama-server `/v1/chat/completions`.
    ServerChat,
    /// llama-server `/completion`.
    ServerCompletion,
    /// OpenAI-compatible hosted API.
    Remote,
}

impl Dialect {
    /// Neutral fields this dialect consumes; everything else is dropped.
    pub fn consumed_fields(self) -> &'static [NeutralField] {
        use NeutralField::*;
        match self {
            Self::Direct => &[
                MaxTokens,
                Temperature,
                TopP,
                TopK,
                RepetitionPenalty,
                RepeatLastN,
                MinP,
                Stop,
            ],
            Self::ServerChat => &[
                MaxTokens,
                Temperature,
                TopP,
                TopK,
                RepetitionPenalty,
                RepeatLastN,
                MinP,
                PresencePenalty,
                FrequencyPenalty,
                Stop,
                SystemPrompt,
            ],
            Self::ServerCompletion => &[MaxTokens, Temperature, TopP, TopK, Stop],
            Self::Remote => &[
                MaxTokens,
                Temperature,
                TopP,
                PresencePenalty,
                FrequencyPenalty,
                Stop,
                SystemPrompt,
            ],
        }
    }

    /// Wire names a consumed field is emitted under. Empty means the field
    /// is consumed structurally (e.g. the system prompt becomes a message).
    pub fn wire_names(self, field: NeutralField) -> &'static [&'static str] {
        match (self, field) {
            (Self::Direct, NeutralField::MaxTokens) => &["max_tokens", "max_new_tokens"],
            (Self::ServerChat, NeutralField::MaxTokens) => &["n_predict"],
            (Self::ServerChat, NeutralField::RepetitionPenalty) => &["repeat_penalty"],
            (Self::ServerChat | Self::Remote, NeutralField::SystemPrompt) => &[],
            (_, NeutralField::MaxTokens) => &["max_tokens"],
            (_, NeutralField::Temperature) => &["temperature"],
            (_, NeutralField::TopP) => &["top_p"],
            (_, NeutralField::TopK) => &["top_k"],
            (_, NeutralField::RepetitionPenalty) => &["repetition_penalty"],
            (_, NeutralField::RepeatLastN) => &["repeat_last_n"],
            (_, NeutralField::MinP) => &["min_p"],
            (_, NeutralField::PresencePenalty) => &["presence_penalty"],
            (_, NeutralField::FrequencyPenalty) => &["frequency_penalty"],
            (_, NeutralField::Stop) => &["stop"],
            (_, NeutralField::SystemPrompt) => &[],
        }
    }

    fn default_max_tokens(self) -> Option<u32> {
        match self {
            Self::Direct => Some(DEFAULT_MAX_TOKENS),
            Self::ServerChat | Self::ServerCompletion => Some(SERVER_DEFAULT_MAX_TOKENS),
            Self::Remote => None,
        }
    }

    /// Translate neutral params into this dialect's parameter object.
    pub fn translate(self, params: &GenerationParams) -> Map<String, Value> {
        let mut out = Map::new();
        for &field in self.consumed_fields() {
            let value = match field {
                NeutralField::MaxTokens => params
                    .max_tokens
                    .or_else(|| self.default_max_tokens())
                    .map(Value::from),
                _ => params.value(field),
            };
            let Some(value) = value else { continue };
            for name in self.wire_names(field) {
                out.insert((*name).to_string(), value.clone());
            }
        }
        if self == Self::ServerCompletion && !out.contains_key("stop") {
            out.insert("stop".to_string(), json!([]));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{param, BackendType};

    #[test]
    fn test_consumed_fields_have_wire_names() {
        for dialect in [Dialect::Direct, Dialect::ServerChat, Dialect::ServerCompletion, Dialect::Remote] {
            for &field in dialect.consumed_fields() {
                if field == NeutralField::SystemPrompt {
                    continue;
                }
                assert!(
                    !dialect.wire_names(field).is_empty(),
                    "{dialect:?} consumes {field:?} without a wire name"
                );
            }
        }
    }

    #[test]
    fn test_resolve_prefers_caller_then_model() {
        let model = ModelConfig::new("m", "/m.gguf", BackendType::Direct)
            .with_param(param::TEMPERATURE, 0.5)
            .with_param(param::TOP_K, 12u32);
        let params = GenerationParams::default().with_temperature(0.2).resolve(&model);
        assert_eq!(params.temperature, Some(0.2));
        assert_eq!(params.top_k, Some(12));
        assert_eq!(params.max_tokens, None);
    }

    #[test]
    fn test_resolve_fills_catalog_defaults() {
        let model = ModelConfig::new("m", "/m.gguf", BackendType::Direct);
        let params = GenerationParams::default().resolve(&model);
        assert_eq!(params.temperature, Some(0.8));
        assert_eq!(params.top_p, Some(0.95));
        assert_eq!(params.top_k, Some(40));
        assert_eq!(params.repetition_penalty, Some(1.06));
        assert_eq!(params.min_p, Some(0.05));
        assert_eq!(params.repeat_last_n, Some(64));
        assert!(params.presence_penalty.is_none());
    }
}
