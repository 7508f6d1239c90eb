//! Locating the llama-server executable.

use std::path::{Path, PathBuf};

/// Relative locations searched when no executable is configured.
pub const EXECUTABLE_CANDIDATES: &[&str] = &[
    "llama-server",
    "./llama-server",
    "bin/llama-server",
    "llama.cpp/build/bin/llama-server",
    "llama.cpp/llama-server",
];

fn with_exe_suffix(name: &str) -> String {
    let suffix = std::env::consts::EXE_SUFFIX;
    if suffix.is_empty() || name.ends_with(suffix) {
        name.to_string()
    } else {
        format!("{name}{suffix}")
    }
}

fn is_bare_name(name: &Path) -> bool {
    name.components().count() == 1 && !name.is_absolute() && !name.starts_with(".")
}

/// Look a bare program name up on `PATH`.
pub fn search_path(name: &str) -> Option<PathBuf> {
    let name = with_exe_suffix(name);
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(&name))
        .find(|p| p.is_file())
}

fn resolve_one(candidate: &Path) -> Option<PathBuf> {
    let text = candidate.to_string_lossy();
    let with_suffix = PathBuf::from(with_exe_suffix(&text));
    if is_bare_name(candidate) {
        return search_path(&text).or_else(|| with_suffix.is_file().then_some(with_suffix));
    }
    [candidate.to_path_buf(), with_suffix].into_iter().find(|p| p.is_file())
}

/// The configured executable when given, else the first existing candidate.
pub fn resolve_executable(configured: Option<&Path>) -> Option<PathBuf> {
    match configured {
        Some(path) => resolve_one(path),
        None => EXECUTABLE_CANDIDATES
            .iter()
            .find_map(|c| resolve_one(Path::new(c))),
    }
}
