//! Model catalog: descriptors, durable store and discovery.

pub mod discovery;
mod store;
mod types;

pub use discovery::{scan, DiscoveryError, DiscoveryOptions};
pub use store::{write_atomic, ConfigStore, QuarantineReason, QuarantineRecord, StoreError};
pub use types::{
    name_key, normalize_path, param, BackendType, ChatFormat, ModelConfig, ModelFormat, ParamValue,
    DEFAULT_BATCH_SIZE, DEFAULT_CONTEXT_SIZE, DEFAULT_MIN_P, DEFAULT_REPEAT_LAST_N,
    DEFAULT_REPETITION_PENALTY, DEFAULT_TEMPERATURE, DEFAULT_TOP_K, DEFAULT_TOP_P,
};
