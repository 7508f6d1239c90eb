//! Model artifact discovery.
//!
//! Walks model directories, classifies artifacts by extension, header magic
//! and sibling files, and builds default descriptors for them.

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::types::{param, BackendType, ChatFormat, ModelConfig, ModelFormat, DEFAULT_BATCH_SIZE, DEFAULT_CONTEXT_SIZE};
use crate::sizing::{estimate_gpu_layers, path_hint_text, NameHints, VramTier};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub const MODEL_EXTENSIONS: &[&str] = &["gguf", "ggml", "bin", "safetensors", "pt", "pth"];

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
/// GGML family magics as stored on disk (little-endian `ggml`, `ggmf`, `ggjt`).
const GGML_MAGICS: &[&[u8; 4]] = &[b"lmgg", b"fmgg", b"tjgg"];
const SIDECAR_CONFIG: &str = "config.json";

/// Ordered chat-format rules; the first matching substring wins.
static CHAT_FORMAT_RULES: &[(&[&str], ChatFormat)] = &[
    (&["llama-3", "llama3", "dark-champion", "darkchampion"], ChatFormat::Llama3),
    (&["wizard"], ChatFormat::Vicuna),
    (&["chatml", "chat-ml", "command-r", "commandr"], ChatFormat::ChatMl),
    (&["llama-2", "llama2"], ChatFormat::Llama2),
    (&["mistral", "mixtral"], ChatFormat::Mistral),
    (&["deepseek", "hermes", "dolphin", "qwen"], ChatFormat::ChatMl),
    (&["gemma"], ChatFormat::Gemma),
    (&["openchat"], ChatFormat::OpenChat),
    (&["alpaca"], ChatFormat::Alpaca),
    (&["vicuna"], ChatFormat::Vicuna),
];

/// Discovery tuning.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Files smaller than this are ignored.
    pub min_size_bytes: u64,
    pub vram_tier: VramTier,
    pub max_depth: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            min_size_bytes: 1024 * 1024,
            vram_tier: VramTier::default(),
            max_depth: 8,
        }
    }
}

/// Pick a chat template from lowercase filename and parent-directory text.
pub fn infer_chat_format(text: &str) -> ChatFormat {
    let lower = text.to_lowercase();
    CHAT_FORMAT_RULES
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, format)| format.clone())
        .unwrap_or_default()
}

/// Read the first four bytes of a file and match known container magics.
pub fn sniff_magic(path: &Path) -> Result<Option<ModelFormat>, DiscoveryError> {
    let mut header = [0u8; 4];
    let mut file = fs::File::open(path).map_err(|source| DiscoveryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(source) => return Err(DiscoveryError::Io { path: path.to_path_buf(), source }),
    }

    if &header == GGUF_MAGIC {
        Ok(Some(ModelFormat::Gguf))
    } else if GGML_MAGICS.iter().any(|m| **m == header) {
        Ok(Some(ModelFormat::Ggml))
    } else {
        Ok(None)
    }
}

fn has_sidecar_config(path: &Path) -> bool {
    path.parent()
        .map(|dir| dir.join(SIDECAR_CONFIG).is_file())
        .unwrap_or(false)
}

/// Classify a candidate file, or `None` if it is not a model artifact.
pub fn classify(path: &Path) -> Result<Option<ModelFormat>, DiscoveryError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let format = match ext.as_str() {
        "gguf" => Some(ModelFormat::Gguf),
        "ggml" => Some(ModelFormat::Ggml),
        "bin" => match sniff_magic(path)? {
            Some(format) => Some(format),
            None if has_sidecar_config(path) => Some(ModelFormat::HfDirectory),
            None => None,
        },
        "safetensors" if has_sidecar_config(path) => Some(ModelFormat::HfDirectory),
        "safetensors" => Some(ModelFormat::Safetensors),
        "pt" | "pth" if has_sidecar_config(path) => Some(ModelFormat::HfDirectory),
        "pt" | "pth" => Some(ModelFormat::Pytorch),
        _ => None,
    };
    Ok(format)
}

fn display_name(root: &Path, file: &Path, format: ModelFormat) -> String {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = file.parent().filter(|p| *p != root);
    let parent_name = parent
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned());

    match (format, parent_name) {
        (ModelFormat::HfDirectory, Some(dir)) => dir,
        (_, Some(dir)) => format!("{dir} - {stem}"),
        (_, None) => stem,
    }
}

/// Build the default descriptor for a classified artifact.
pub fn describe(root: &Path, file: &Path, format: ModelFormat, size: u64, tier: VramTier) -> ModelConfig {
    let name = display_name(root, file, format);
    let haystack = path_hint_text(file);

    let mut config = ModelConfig::new(name, file, BackendType::Direct);
    config.format = format;
    config.chat_format = infer_chat_format(&haystack);
    config.set_param(param::CONTEXT_SIZE, DEFAULT_CONTEXT_SIZE);
    config.set_param(param::BATCH_SIZE, DEFAULT_BATCH_SIZE);
    let hints = NameHints::parse(&haystack);
    config.set_param(param::GPU_LAYERS, estimate_gpu_layers(size, &hints, tier));
    config.apply_family_defaults();
    config
}

/// Recursively scan `roots` for model artifacts.
///
/// Unreadable directories and files are logged and skipped. Directory-based
/// checkpoints yield one descriptor per directory.
pub fn scan(roots: &[PathBuf], options: &DiscoveryOptions) -> Vec<ModelConfig> {
    let mut found = Vec::new();
    for root in roots {
        if !root.is_dir() {
            warn!(root = %root.display(), "Discovery root is not a directory");
            continue;
        }
        let mut seen_dirs = HashSet::new();
        walk(root, root, 0, options, &mut seen_dirs, &mut found);
    }
    debug!(count = found.len(), "Discovery scan complete");
    found
}

fn walk(
    root: &Path,
    dir: &Path,
    depth: usize,
    options: &DiscoveryOptions,
    seen_dirs: &mut HashSet<PathBuf>,
    found: &mut Vec<ModelConfig>,
) {
    let mut entries: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
            return;
        }
    };
    entries.sort();

    for path in entries {
        let Ok(meta) = fs::symlink_metadata(&path) else { continue };
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(false);

        if meta.is_dir() {
            if !hidden && depth < options.max_depth {
                walk(root, &path, depth + 1, options, seen_dirs, found);
            }
            continue;
        }

        let is_candidate = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| MODEL_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !is_candidate || hidden {
            continue;
        }

        // Follow file symlinks, but never directory ones.
        let size = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m.len(),
            _ => continue,
        };
        if size < options.min_size_bytes {
            continue;
        }

        let format = match classify(&path) {
            Ok(Some(format)) => format,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable model candidate");
                continue;
            }
        };

        if format == ModelFormat::HfDirectory && !seen_dirs.insert(dir.to_path_buf()) {
            continue;
        }

        found.push(describe(root, &path, format, size, options.vram_tier));
    }
}
