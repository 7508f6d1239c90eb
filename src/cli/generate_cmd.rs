// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! Load and generate CLI subcommands.

use crate::provider::GenerationParams;
use crate::runtime::{ModelRuntime, GENERATION_FAILED_PREFIX, NO_MODEL_LOADED};

use super::flag_value;

/// Generation flags: `--max-tokens`, `--temperature`, `--top-p`, `--top-k`,
/// `--system`. Unparseable numbers are rejected.
pub fn parse_generation_flags(args: &[String]) -> Result<GenerationParams, String> {
    fn num<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>, String> {
        flag_value(args, flag)
            .map(|v| v.parse::<T>().map_err(|_| format!("invalid value for {flag}: {v}")))
            .transpose()
    }

    Ok(GenerationParams {
        max_tokens: num(args, "--max-tokens")?,
        temperature: num(args, "--temperature")?,
        top_p: num(args, "--top-p")?,
        top_k: num(args, "--top-k")?,
        system_prompt: flag_value(args, "--system").map(str::to_string),
        ..GenerationParams::default()
    })
}

/// Run `load <name>`. Returns exit code 0 on success, 1 on failure.
pub async fn run_load(runtime: &ModelRuntime, name: &str) -> i32 {
    match runtime.try_load(name).await {
        Ok(handle) => {
            println!("loaded: {} ({})", handle.name(), handle.backend_type());
            runtime.shutdown().await;
            0
        }
        Err(e) => {
            eprintln!("Load failed: {e}");
            1
        }
    }
}

/// Run `generate <name> <prompt> [flags]`.
///
/// Returns exit code: 0 on success, 1 on load or generation failure,
/// 2 on bad flags.
pub async fn run_generate(runtime: &ModelRuntime, name: &str, prompt: &str, args: &[String]) -> i32 {
    let params = match parse_generation_flags(args) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            return super::EXIT_CONFIG;
        }
    };
    if let Err(e) = runtime.try_load(name).await {
        eprintln!("Load failed: {e}");
        return 1;
    }

    let text = runtime.generate(prompt, &params).await;
    runtime.shutdown().await;
    if text == NO_MODEL_LOADED || text.starts_with(GENERATION_FAILED_PREFIX) {
        eprintln!("{text}");
        1
    } else {
        println!("{text}");
        0
    }
}
