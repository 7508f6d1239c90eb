//! Metric recording helpers over the `metrics` facade.
//!
//! No exporter is installed here; without a recorder these calls are no-ops.

use std::time::Duration;

pub fn record_load_success(model: &str, backend: &str, elapsed: Duration) {
    metrics::counter!("gg_orch_loads_total", "model" => model.to_string(), "backend" => backend.to_string(), "result" => "ok")
        .increment(1);
    metrics::histogram!("gg_orch_load_seconds", "backend" => backend.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_load_failure(model: &str, backend: &str) {
    metrics::counter!("gg_orch_loads_total", "model" => model.to_string(), "backend" => backend.to_string(), "result" => "error")
        .increment(1);
}

pub fn record_server_start(reused: bool) {
    let outcome = if reused { "reused" } else { "spawned" };
    metrics::counter!("gg_orch_server_starts_total", "outcome" => outcome).increment(1);
}

pub fn record_generation(backend: &str, ok: bool, elapsed: Duration) {
    let result = if ok { "ok" } else { "error" };
    metrics::counter!("gg_orch_generations_total", "backend" => backend.to_string(), "result" => result)
        .increment(1);
    metrics::histogram!("gg_orch_generation_seconds", "backend" => backend.to_string())
        .record(elapsed.as_secs_f64());
}
