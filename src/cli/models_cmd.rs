// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! Models CLI subcommands: list, scan.

use std::path::PathBuf;

use crate::catalog::ModelConfig;
use crate::runtime::ModelRuntime;

/// Run `models list`. Returns exit code 0.
pub fn run_list(runtime: &ModelRuntime) -> i32 {
    let active = runtime.get_active_model().map(|c| c.name);
    print_models(&runtime.list_models(), active.as_deref());
    for record in runtime.store().quarantined() {
        eprintln!("quarantined: {} ({:?})", record.file.display(), record.reason);
    }
    0
}

/// Run `models scan <dir>...`, falling back to the configured roots.
///
/// Returns exit code: 0 on success, 1 when there is nothing to scan.
pub fn run_scan(runtime: &ModelRuntime, dirs: &[String]) -> i32 {
    let added = if dirs.is_empty() {
        if runtime.config().discovery.roots.is_empty() {
            eprintln!("No directories given and GG_ORCH_MODEL_ROOTS is unset.");
            return 1;
        }
        runtime.scan_configured()
    } else {
        let roots: Vec<PathBuf> = dirs.iter().map(PathBuf::from).collect();
        runtime.scan(&roots)
    };

    if added.is_empty() {
        println!("No new models found.");
    } else {
        for name in &added {
            println!("added: {name}");
        }
        println!("{} model(s) added", added.len());
    }
    0
}

/// Format and print model configs to stdout.
pub fn print_models(models: &[ModelConfig], active: Option<&str>) {
    if models.is_empty() {
        println!("No models configured.");
        return;
    }

    println!(
        "{:<40} {:<10} {:<12} {:>6} {:<20} {:<6}",
        "NAME", "BACKEND", "FORMAT", "USES", "LAST USED", "ACTIVE"
    );
    println!("{}", "-".repeat(99));

    for m in models {
        let last_used = m
            .last_used
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        let is_active = active == Some(m.name.as_str());
        println!(
            "{:<40} {:<10} {:<12} {:>6} {:<20} {:<6}",
            truncate(&m.name, 39),
            m.backend_type.as_str(),
            m.format.as_str(),
            m.usage_count,
            last_used,
            if is_active { "*" } else { "" },
        );
    }

    println!("{}", "-".repeat(99));
    println!("{} model(s)", models.len());
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((cut, _)) => &s[..cut],
        None => s,
    }
}
