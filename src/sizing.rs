//! GPU offload sizing heuristic.
//!
//! Estimates how many layers to offload from file size, name hints
//! (mixture-of-experts, quantization bits) and a VRAM tier. Everything
//! here is pure so callers can test it without touching the filesystem.

use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

const GIB: u64 = 1024 * 1024 * 1024;

/// Bonus for mixture-of-experts models.
const MOE_BONUS: i64 = 8;
/// Bonus for 1-3 bit quantizations.
const LOW_BIT_BONUS: i64 = 8;
/// Bonus for 4-8 bit quantizations.
const MID_BIT_BONUS: i64 = 4;

/// Coarse VRAM capacity profile of the host GPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VramTier {
    /// Under 6 GB, or integrated graphics.
    Low,
    #[default]
    Medium,
    High,
    /// 24 GB and above.
    Ultra,
}

impl VramTier {
    fn offset(self) -> i64 {
        match self {
            Self::Low => -8,
            Self::Medium => 0,
            Self::High => 8,
            Self::Ultra => 16,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Ultra => "ultra",
        }
    }
}

impl FromStr for VramTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "mid" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "ultra" => Ok(Self::Ultra),
            other => Err(format!("unknown VRAM tier: {other}")),
        }
    }
}

/// Hints extracted from a model's file or display name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NameHints {
    pub moe: bool,
    /// Lowest quantization bit width found in the name.
    pub quant_bits: Option<u8>,
}

fn quant_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[^a-z0-9])(?:i?q([1-8])|b?fp?(16|32))(?:[^0-9]|$)")
            .expect("static quant pattern")
    })
}

fn expert_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[^a-z0-9])(\d{1,3})x(\d{1,3}(?:\.\d+)?)b(?:[^a-z]|$)")
            .expect("static expert pattern")
    })
}

fn moe_word_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[^a-z])moe(?:[^a-z]|$)").expect("static moe pattern"))
}

impl NameHints {
    /// Parse hints from a name such as `mixtral-8x7b-instruct.Q4_K_M.gguf`.
    pub fn parse(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        let moe = moe_word_pattern().is_match(&lower)
            || lower.contains("mixture")
            || lower.contains("mixtral")
            || expert_pattern().is_match(&lower);

        // Overlapping separators mean a plain captures_iter can skip an
        // adjacent match, so rescan from each hit.
        let mut quant_bits: Option<u8> = None;
        let mut start = 0;
        while let Some(caps) = quant_pattern().captures_at(&lower, start) {
            let bits = caps
                .get(1)
                .or_else(|| caps.get(2))
                .and_then(|m| m.as_str().parse::<u8>().ok());
            if let Some(bits) = bits {
                quant_bits = Some(quant_bits.map_or(bits, |b| b.min(bits)));
            }
            let Some(whole) = caps.get(0) else { break };
            start = whole.start() + 1;
            if start >= lower.len() {
                break;
            }
        }

        Self { moe, quant_bits }
    }

    /// Hints for a file on disk, see [`path_hint_text`].
    pub fn for_path(path: &Path) -> Self {
        Self::parse(&path_hint_text(path))
    }
}

/// `parent/file_name` of `path`, the text name hints are read from.
///
/// Hints often live only in the model directory (`Mixtral-8x7B/model.gguf`).
pub fn path_hint_text(path: &Path) -> String {
    let component = |p: Option<&std::ffi::OsStr>| {
        p.map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    };
    let parent = component(path.parent().and_then(|p| p.file_name()));
    format!("{parent}/{}", component(path.file_name()))
}

/// Expert count from an `NxMb` pattern (`8x7b` yields 8).
pub fn expert_count(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    expert_pattern()
        .captures(&lower)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .filter(|n| *n > 1)
}

fn base_layers(file_size_bytes: u64) -> i64 {
    let gib = file_size_bytes as f64 / GIB as f64;
    if gib < 5.0 {
        32
    } else if gib < 10.0 {
        24
    } else if gib < 20.0 {
        20
    } else if gib < 30.0 {
        16
    } else if gib < 40.0 {
        8
    } else {
        4
    }
}

/// Rough layer count for a model of the given size.
///
/// Never below the largest adjusted estimate, so the clamp in
/// [`estimate_gpu_layers`] only ever trims negatives.
pub fn total_layers_estimate(file_size_bytes: u64) -> u32 {
    let gib = file_size_bytes / GIB;
    match gib {
        0..=9 => 64,
        10..=39 => 80,
        _ => 96,
    }
}

fn quant_bonus(bits: Option<u8>) -> i64 {
    match bits {
        Some(1..=3) => LOW_BIT_BONUS,
        Some(4..=8) => MID_BIT_BONUS,
        _ => 0,
    }
}

/// Estimate GPU-offloaded layers.
pub fn estimate_gpu_layers(file_size_bytes: u64, hints: &NameHints, tier: VramTier) -> u32 {
    let mut layers = base_layers(file_size_bytes);
    if hints.moe {
        layers += MOE_BONUS;
    }
    layers += quant_bonus(hints.quant_bits);
    layers += tier.offset();

    let ceiling = i64::from(total_layers_estimate(file_size_bytes));
    u32::try_from(layers.clamp(0, ceiling)).unwrap_or(0)
}

/// Estimate for a file on disk, with name hints from its directory and file name.
pub fn estimate_for_file(path: &Path, tier: VramTier) -> std::io::Result<u32> {
    let size = std::fs::metadata(path)?.len();
    Ok(estimate_gpu_layers(size, &NameHints::for_path(path), tier))
}
