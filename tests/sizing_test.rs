//! Monotonicity of the GPU layer estimate.

use gg_orchestrator::sizing::{estimate_for_file, estimate_gpu_layers, total_layers_estimate, NameHints, VramTier};

const GIB: u64 = 1024 * 1024 * 1024;

const TIERS: [VramTier; 4] = [VramTier::Low, VramTier::Medium, VramTier::High, VramTier::Ultra];

fn sizes() -> Vec<u64> {
    [0, 1, 4, 5, 6, 9, 10, 15, 20, 25, 30, 35, 40, 70, 120]
        .iter()
        .map(|g| g * GIB)
        .collect()
}

#[test]
fn test_larger_files_never_get_more_layers() {
    for tier in TIERS {
        for hints in [NameHints::default(), NameHints { moe: true, quant_bits: Some(2) }] {
            let estimates: Vec<u32> = sizes().iter().map(|s| estimate_gpu_layers(*s, &hints, tier)).collect();
            assert!(
                estimates.windows(2).all(|w| w[0] >= w[1]),
                "{tier:?} {hints:?}: {estimates:?}"
            );
        }
    }
}

#[test]
fn test_bigger_tier_never_gets_fewer_layers() {
    let hints = NameHints { moe: false, quant_bits: Some(4) };
    for size in sizes() {
        let estimates: Vec<u32> = TIERS.iter().map(|t| estimate_gpu_layers(size, &hints, *t)).collect();
        assert!(estimates.windows(2).all(|w| w[0] <= w[1]), "{size}: {estimates:?}");
    }
}

#[test]
fn test_hints_only_add_layers() {
    let plain = NameHints::default();
    for tier in TIERS {
        for size in sizes() {
            let base = estimate_gpu_layers(size, &plain, tier);
            let moe = estimate_gpu_layers(size, &NameHints { moe: true, quant_bits: None }, tier);
            let low_bit = estimate_gpu_layers(size, &NameHints { moe: false, quant_bits: Some(3) }, tier);
            let mid_bit = estimate_gpu_layers(size, &NameHints { moe: false, quant_bits: Some(6) }, tier);
            let wide = estimate_gpu_layers(size, &NameHints { moe: false, quant_bits: Some(16) }, tier);
            assert!(moe >= base);
            assert!(low_bit >= mid_bit && mid_bit >= base);
            assert_eq!(wide, base);
        }
    }
}

#[test]
fn test_estimate_within_layer_ceiling() {
    let hints = NameHints { moe: true, quant_bits: Some(1) };
    for size in sizes() {
        assert!(estimate_gpu_layers(size, &hints, VramTier::Ultra) <= total_layers_estimate(size));
    }
}

#[test]
fn test_known_values() {
    let mixtral = NameHints::parse("mixtral-8x7b-instruct.Q4_K_M.gguf");
    // 24 base + 8 moe + 4 mid-bit
    assert_eq!(estimate_gpu_layers(7 * GIB, &mixtral, VramTier::Medium), 36);
    assert_eq!(estimate_gpu_layers(7 * GIB, &mixtral, VramTier::Ultra), 52);
    assert_eq!(estimate_gpu_layers(35 * GIB, &NameHints::default(), VramTier::Low), 0);
}

#[test]
fn test_tier_parsing() {
    assert_eq!("ULTRA".parse::<VramTier>().unwrap(), VramTier::Ultra);
    assert_eq!(" mid ".parse::<VramTier>().unwrap(), VramTier::Medium);
    assert!("huge".parse::<VramTier>().is_err());
}

#[test]
fn test_estimate_for_small_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("phi-2.Q2_K.gguf");
    std::fs::write(&path, b"GGUF").unwrap();
    // 32 base + 8 low-bit
    assert_eq!(estimate_for_file(&path, VramTier::Medium).unwrap(), 40);
    assert!(estimate_for_file(&dir.path().join("absent.gguf"), VramTier::Medium).is_err());
}
