// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config CLI subcommands: show, defaults, validate.
//!
//! These read configuration directly and never open the model store.

use crate::config::{self, effective_config, EffectiveConfig, OrchestratorConfig};
use crate::supervisor::resolve_executable;

/// Print the effective config. Returns exit code 0, or 2 on a config error.
pub fn run_show() -> i32 {
    match config::load() {
        Ok(cfg) => {
            print_config(&effective_config(&cfg));
            0
        }
        Err(e) => {
            eprintln!("Configuration error: {e}");
            super::EXIT_CONFIG
        }
    }
}

/// Print built-in defaults, ignoring files and environment.
pub fn run_defaults() {
    print_config(&effective_config(&OrchestratorConfig::default()));
}

/// Warnings for a loaded config that will not work as written.
pub fn validation_warnings(cfg: &OrchestratorConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    for root in &cfg.discovery.roots {
        if !root.is_dir() {
            warnings.push(format!("model root {} is not a directory", root.display()));
        }
    }
    if cfg.loading.allow_server_escalation && resolve_executable(cfg.server.executable.as_deref()).is_none() {
        warnings.push("server escalation is on but no llama-server executable was found".to_string());
    }
    if cfg.server.generation_timeout <= cfg.server.probe_timeout {
        warnings.push("generation timeout is not longer than the health probe timeout".to_string());
    }
    warnings
}

/// Returns 0 if valid, 1 if any warnings are found, 2 on a config error.
pub fn run_validate() -> i32 {
    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return super::EXIT_CONFIG;
        }
    };
    let warnings = validation_warnings(&cfg);
    if warnings.is_empty() {
        println!("Configuration is valid.");
        0
    } else {
        for w in &warnings {
            eprintln!("WARNING: {w}");
        }
        1
    }
}

fn print_config(cfg: &EffectiveConfig) {
    println!("config_dir={}", cfg.config_dir);
    println!("model_roots={}", cfg.model_roots.join(","));
    println!("max_load_attempts={}", cfg.max_load_attempts);
    println!("fallback_attempt_bound={}", cfg.fallback_attempt_bound);
    println!("allow_server_escalation={}", cfg.allow_server_escalation);
    println!("warmup_capacity={}", cfg.warmup_capacity);
    println!("server_executable={}", cfg.server_executable.as_deref().unwrap_or("(auto)"));
    println!("server_addr={}", cfg.server_addr);
    println!("health_interval_ms={}", cfg.health_interval_ms);
    println!("health_attempts={}", cfg.health_attempts);
    println!("generation_timeout_secs={}", cfg.generation_timeout_secs);
    println!("terminate_timeout_secs={}", cfg.terminate_timeout_secs);
    println!("remote_base_url={}", cfg.remote_base_url);
    println!("vram_tier={}", cfg.vram_tier);
    println!("n_threads={}", cfg.n_threads);
    println!("log_level={}", cfg.log_level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_defaults_print() {
        run_defaults();
    }

    #[test]
    fn test_missing_root_warns() {
        let mut cfg = OrchestratorConfig::default();
        cfg.loading.allow_server_escalation = false;
        cfg.discovery.roots = vec![PathBuf::from("/nonexistent/models")];
        let warnings = validation_warnings(&cfg);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("/nonexistent/models"));
    }

    #[test]
    fn test_clean_config_has_no_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = OrchestratorConfig::default();
        cfg.loading.allow_server_escalation = false;
        cfg.discovery.roots = vec![dir.path().to_path_buf()];
        assert!(validation_warnings(&cfg).is_empty());
    }
}
