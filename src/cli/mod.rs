// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommands for the orchestrator binary.
//!
//! ## Usage
//!
//! ```bash
//! gg-orchestrator-cli models list
//! gg-orchestrator-cli models scan ~/models
//! gg-orchestrator-cli load "llama - Meta-Llama-3-8B.Q4_K_M"
//! gg-orchestrator-cli generate "llama - Meta-Llama-3-8B.Q4_K_M" "Hello"
//! gg-orchestrator-cli config show
//! ```

pub mod config_cmd;
pub mod generate_cmd;
pub mod models_cmd;

use crate::config;
use crate::runtime::ModelRuntime;
use crate::telemetry::{init_logging, LogError};

/// Exit code for configuration problems.
pub const EXIT_CONFIG: i32 = 2;

/// Load configuration, start logging and open the runtime.
pub fn open_runtime() -> Result<ModelRuntime, i32> {
    let cfg = config::load().map_err(|e| {
        eprintln!("Configuration error: {e}");
        EXIT_CONFIG
    })?;
    match init_logging(&cfg.logging) {
        Ok(()) | Err(LogError::AlreadyInitialized) => {}
        Err(e) => {
            eprintln!("Logging setup failed: {e}");
            return Err(EXIT_CONFIG);
        }
    }
    ModelRuntime::new(cfg).map_err(|e| {
        eprintln!("Could not open model store: {e}");
        1
    })
}

/// Value following `flag` in `args`, if present.
pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}
