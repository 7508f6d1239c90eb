//! gg-orchestrator-cli entry point.
//!
//! ## CLI Subcommands
//!
//! - `models list` / `models scan <dir>...` - Inspect and grow the catalog
//! - `load <name>` - Load a model and report the backend it came up on
//! - `generate <name> <prompt>` - Load, generate once, shut down
//! - `recover` - Reload the last active model or a fallback
//! - `config show|defaults|validate` - Configuration

use std::process::ExitCode;

use gg_orchestrator::cli::{config_cmd, generate_cmd, models_cmd, open_runtime};

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("gg-orchestrator {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => exit(config_cmd::run_show()),
                "defaults" => {
                    config_cmd::run_defaults();
                    ExitCode::SUCCESS
                }
                "validate" => exit(config_cmd::run_validate()),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_usage();
                    ExitCode::FAILURE
                }
            }
        }
        "models" | "load" | "generate" | "recover" => {
            let runtime = match open_runtime() {
                Ok(rt) => rt,
                Err(code) => return exit(code),
            };
            runtime.install_exit_handlers();

            let code = match command {
                "models" => match args.get(2).map(|s| s.as_str()).unwrap_or("list") {
                    "list" => models_cmd::run_list(&runtime),
                    "scan" => models_cmd::run_scan(&runtime, &args[3.min(args.len())..]),
                    other => {
                        eprintln!("Unknown models subcommand: {}", other);
                        1
                    }
                },
                "load" => match args.get(2) {
                    Some(name) => generate_cmd::run_load(&runtime, name).await,
                    None => {
                        eprintln!("usage: load <name>");
                        2
                    }
                },
                "generate" => match (args.get(2), args.get(3)) {
                    (Some(name), Some(prompt)) => {
                        generate_cmd::run_generate(&runtime, name, prompt, &args[4..]).await
                    }
                    _ => {
                        eprintln!("usage: generate <name> <prompt> [--max-tokens N] [--temperature T]");
                        2
                    }
                },
                _ => {
                    let ok = runtime.recover().await;
                    if let Some(active) = runtime.get_active_model() {
                        println!("active: {}", active.name);
                    }
                    runtime.shutdown().await;
                    if ok {
                        0
                    } else {
                        1
                    }
                }
            };
            exit(code)
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "gg-orchestrator-cli v{}

USAGE:
    gg-orchestrator-cli <COMMAND> [ARGS]

COMMANDS:
    models list              List configured models
    models scan [DIR]...     Discover models (default: GG_ORCH_MODEL_ROOTS)
    load <NAME>              Load a model, then release it
    generate <NAME> <PROMPT> Load a model and generate one response
    recover                  Load the last active model or a fallback
    config show              Print effective configuration
    config defaults          Print built-in defaults
    config validate          Check configuration for problems
    version                  Show version information
    help                     Show this help message

GENERATE OPTIONS:
    --max-tokens N   --temperature T   --top-p P   --top-k K   --system TEXT

ENVIRONMENT:
    GG_ORCH_CONFIG       TOML config file
    GG_ORCH_CONFIG_DIR   Model config directory (default: ./configs)
    GG_ORCH_LOG_LEVEL    Log filter (e.g. info, gg_orchestrator=debug)
    GG_ORCH_LOG_FORMAT   json | pretty

EXIT CODES:
    0  Success
    1  Failure
    2  Usage or configuration error
",
        version
    );
}
