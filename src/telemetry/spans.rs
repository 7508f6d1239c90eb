//! Span utilities and extension traits for orchestrator tracing.

use tracing::{info_span, Span};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Span for one `load()` attempt.
///
/// `backend` and `status` are filled in once the outcome is known.
pub fn load_span(model: &str) -> Span {
    info_span!(
        "model_load",
        model = %model,
        backend = tracing::field::Empty,
        status = tracing::field::Empty,
        error.message = tracing::field::Empty,
    )
}

/// Span for one generation call.
pub fn generate_span(model: &str, backend: &str) -> Span {
    info_span!(
        "generate",
        model = %model,
        backend = %backend,
        status = tracing::field::Empty,
        error.message = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    )
}
