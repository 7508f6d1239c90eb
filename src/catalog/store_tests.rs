//! Tests for atomic writes, repair and quarantine.

use super::*;
use crate::catalog::types::{param, BackendType};
use tempfile::TempDir;

fn model_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"GGUF\x03\x00\x00\x00").unwrap();
    path
}

#[test]
fn test_write_atomic_rejects_invalid_and_keeps_original() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("m.json");
    fs::write(&target, b"{\"original\": true}").unwrap();

    let result = write_atomic(&target, b"{ truncated", validate_config_bytes);

    assert!(matches!(result, Err(StoreError::ValidationFailed { .. })));
    assert_eq!(fs::read(&target).unwrap(), b"{\"original\": true}");
    assert!(!tmp_path(&target).exists());
}

#[test]
fn test_repair_trailing_commas() {
    let text = "\u{feff}{\"name\": \"m\", \"path\": \"/m.gguf\", \"parameters\": {\"top_k\": 40,},}";
    let config = repair(text.as_bytes()).unwrap();
    assert_eq!(config.name, "m");
    assert_eq!(config.param_u32(param::TOP_K), Some(40));
}

#[test]
fn test_repaired_document_rewritten_with_backup() {
    let dir = TempDir::new().unwrap();
    let model = model_file(dir.path(), "m.gguf");
    let doc = format!(
        "{{\"name\": \"m\", \"path\": {:?}, \"backend_type\": \"direct\",}}",
        model.to_string_lossy()
    );
    fs::write(dir.path().join("m.json"), doc).unwrap();

    let store = ConfigStore::open(dir.path()).unwrap();

    assert_eq!(store.get("m").unwrap().backend_type, BackendType::Direct);
    let rewritten = fs::read(dir.path().join("m.json")).unwrap();
    assert!(serde_json::from_slice::<ModelConfig>(&rewritten).is_ok());
    assert_eq!(fs::read_dir(dir.path().join(INVALID_DIR)).unwrap().count(), 1);
}

#[test]
fn test_unrepairable_document_quarantined() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("broken.json"), b"\x00\x01 not json").unwrap();

    let store = ConfigStore::open(dir.path()).unwrap();

    assert!(store.is_empty());
    assert!(!dir.path().join("broken.json").exists());
    let quarantined = store.quarantined();
    assert_eq!(quarantined.len(), 1);
    assert!(matches!(quarantined[0].reason, QuarantineReason::Corrupt(_)));
    assert!(quarantined[0].file.exists());
}

#[test]
fn test_file_stem_sanitized() {
    assert_eq!(file_stem("Models - Llama 3"), "models_-_llama_3");
    assert_eq!(file_stem("../.."), "_");
    assert_eq!(file_stem("   "), "model");
}

#[test]
fn test_fresh_file_avoids_collisions() {
    let dir = TempDir::new().unwrap();
    let a = model_file(dir.path(), "a.gguf");
    let b = model_file(dir.path(), "b.gguf");
    let store = ConfigStore::open(dir.path().join("configs")).unwrap();

    store.save(ModelConfig::new("a b", &a, BackendType::Direct)).unwrap();
    store.save(ModelConfig::new("a_b", &b, BackendType::Direct)).unwrap();

    let files = fs::read_dir(store.dir()).unwrap().filter_map(|e| e.ok()).filter(|e| e.path().is_file()).count();
    assert_eq!(files, 2);
    assert_eq!(store.len(), 2);
}

#[test]
fn test_open_discards_interrupted_write() {
    let dir = TempDir::new().unwrap();
    let model = model_file(dir.path(), "m.gguf");
    let target = dir.path().join("m.json");
    let config = ModelConfig::new("m", &model, BackendType::Server);
    fs::write(&target, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    fs::write(tmp_path(&target), b"{\"name\": \"m\", \"pa").unwrap();

    let store = ConfigStore::open(dir.path()).unwrap();

    assert!(!tmp_path(&target).exists());
    assert_eq!(store.get("m").unwrap(), config);
    assert!(store.quarantined().is_empty());
}

#[test]
fn test_blocked_invalid_dir_skips_document() {
    let dir = TempDir::new().unwrap();
    let model = model_file(dir.path(), "good.gguf");
    let good = ModelConfig::new("good", &model, BackendType::Direct);
    let dangling = ModelConfig::new("gone", dir.path().join("gone.gguf"), BackendType::Direct);
    fs::write(dir.path().join("good.json"), serde_json::to_vec(&good).unwrap()).unwrap();
    fs::write(dir.path().join("gone.json"), serde_json::to_vec(&dangling).unwrap()).unwrap();
    fs::write(dir.path().join("broken.json"), b"\x00\x01 not json").unwrap();
    fs::write(dir.path().join(INVALID_DIR), b"not a directory").unwrap();

    let store = ConfigStore::open(dir.path()).unwrap();

    assert_eq!(store.len(), 1);
    assert!(store.contains("good"));
    assert!(dir.path().join("broken.json").exists());
    assert!(dir.path().join("gone.json").exists());
    assert!(store.quarantined().is_empty());
    assert_eq!(store.reload().unwrap(), 1);
}
