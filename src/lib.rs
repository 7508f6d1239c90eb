//! GG Orchestrator
//!
//! Model lifecycle and inference-backend orchestration for local LLMs.
//!
//! A durable catalog of model configs feeds a serialized load orchestrator,
//! which brings one model up at a time on one of three backends:
//!
//! - **Direct**: an in-process native library (llama.cpp behind `gguf`)
//! - **Server**: a supervised `llama-server` child spoken to over HTTP
//! - **Remote**: an OpenAI-compatible hosted API
//!
//! Failed loads are counted per model, direct failures may escalate to the
//! server backend, and automatic recovery skips models whose failure
//! budget is spent.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod models;
pub mod provider;
pub mod runtime;
pub mod sizing;
pub mod supervisor;
pub mod telemetry;

pub use config::OrchestratorConfig;
pub use runtime::{ModelRuntime, GENERATION_FAILED_PREFIX, NO_MODEL_LOADED};
