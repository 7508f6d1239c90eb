//! Telemetry for the orchestrator: structured logging, spans, metric hooks.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    record_generation, record_load_failure, record_load_success, record_server_start,
};
pub use spans::{generate_span, load_span, SpanExt};
