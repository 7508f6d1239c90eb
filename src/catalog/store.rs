//! Durable file-per-model config store.
//!
//! Each model lives in `<dir>/<name>.json`. Writes go to a temp file that is
//! re-parsed before being renamed over the target, so the final document is
//! always either the old or the new complete record. Unparseable documents
//! are backed up to `invalid/`, repaired when possible, and otherwise
//! quarantined. Deleted configs move to `deleted/`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use parking_lot::RwLock;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::{name_key, normalize_path, ModelConfig};

pub const INVALID_DIR: &str = "invalid";
pub const DELETED_DIR: &str = "deleted";
const TMP_SUFFIX: &str = "tmp";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Model config not found: {0}")]
    NotFound(String),

    #[error("Corrupt model config {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Write of {path} rejected: {reason}")]
    ValidationFailed { path: PathBuf, reason: String },

    #[error("Model file {path} is already registered as '{existing}'")]
    Duplicate { path: PathBuf, existing: String },

    #[error("Invalid model name: {0:?}")]
    InvalidName(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a config file was moved out of the live set.
#[derive(Debug, Clone, PartialEq)]
pub enum QuarantineReason {
    Corrupt(String),
    MissingModelFile(PathBuf),
    DuplicateName(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuarantineRecord {
    /// Location of the quarantined document under `invalid/`.
    pub file: PathBuf,
    pub reason: QuarantineReason,
}

struct Entry {
    config: ModelConfig,
    file: PathBuf,
}

/// Persistent catalog of [`ModelConfig`] records keyed by lowercase name.
pub struct ConfigStore {
    dir: PathBuf,
    entries: RwLock<BTreeMap<String, Entry>>,
    quarantined: RwLock<Vec<QuarantineRecord>>,
}

/// Write `bytes` to `target` through a verified temp file.
///
/// `validate` sees the bytes read back from the temp file. On rejection the
/// temp file is removed and `target` is left untouched.
pub fn write_atomic<F>(target: &Path, bytes: &[u8], validate: F) -> Result<(), StoreError>
where
    F: FnOnce(&[u8]) -> Result<(), String>,
{
    let tmp = tmp_path(target);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    let written = fs::read(&tmp)?;
    if let Err(reason) = validate(&written) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::ValidationFailed { path: target.to_path_buf(), reason });
    }

    fs::rename(&tmp, target)?;
    Ok(())
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(TMP_SUFFIX);
    target.with_file_name(name)
}

fn trailing_comma() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",(\s*[}\]])").expect("static trailing comma pattern"))
}

/// Best-effort repair of a hand-edited or partially mangled document.
fn repair(bytes: &[u8]) -> Option<ModelConfig> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_start_matches('\u{feff}');
    let fixed = trailing_comma().replace_all(text, "$1");
    serde_json::from_str(&fixed).ok()
}

fn validate_config_bytes(bytes: &[u8]) -> Result<(), String> {
    serde_json::from_slice::<ModelConfig>(bytes)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// File stem for a model name: lowercase, filesystem-safe.
fn file_stem(name: &str) -> String {
    let stem: String = name_key(name)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    let stem = stem.trim_matches('.').to_string();
    if stem.is_empty() {
        "model".to_string()
    } else {
        stem
    }
}

impl ConfigStore {
    /// Open (creating if needed) the store rooted at `dir` and load it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            entries: RwLock::new(BTreeMap::new()),
            quarantined: RwLock::new(Vec::new()),
        };
        store.reload()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn invalid_dir(&self) -> PathBuf {
        self.dir.join(INVALID_DIR)
    }

    fn deleted_dir(&self) -> PathBuf {
        self.dir.join(DELETED_DIR)
    }

    /// Re-read every document from disk. Returns the number of live configs.
    ///
    /// A corrupt or dangling document never fails the reload; it is
    /// quarantined and reported through [`ConfigStore::quarantined`].
    pub fn reload(&self) -> Result<usize, StoreError> {
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            match path.extension().and_then(|e| e.to_str()) {
                Some(TMP_SUFFIX) => {
                    warn!(file = %path.display(), "Removing interrupted config write");
                    let _ = fs::remove_file(&path);
                }
                Some("json") => files.push(path),
                _ => {}
            }
        }
        files.sort();

        let mut loaded: BTreeMap<String, Entry> = BTreeMap::new();
        for file in files {
            let config = match self.read_document(&file) {
                Ok(Some(config)) => config,
                Ok(None) => continue,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Skipping unreadable config");
                    continue;
                }
            };

            if !config.is_loadable() {
                warn!(model = %config.name, path = %config.path.display(), "Model file missing, quarantining config");
                self.quarantine_or_skip(&file, QuarantineReason::MissingModelFile(config.path.clone()));
                continue;
            }

            let key = config.key();
            if loaded.contains_key(&key) {
                warn!(model = %config.name, file = %file.display(), "Duplicate model name, quarantining config");
                self.quarantine_or_skip(&file, QuarantineReason::DuplicateName(config.name.clone()));
                continue;
            }
            loaded.insert(key, Entry { config, file });
        }

        self.enforce_single_active(&mut loaded)?;

        let count = loaded.len();
        *self.entries.write() = loaded;
        debug!(dir = %self.dir.display(), count, "Config store loaded");
        Ok(count)
    }

    /// Move `file` to `invalid/`. A failed move leaves it in place, unloaded.
    fn quarantine_or_skip(&self, file: &Path, reason: QuarantineReason) {
        match self.quarantine_file(file) {
            Ok(dest) => self.note_quarantine(dest, reason),
            Err(e) => warn!(file = %file.display(), error = %e, "Could not quarantine config, skipping"),
        }
    }

    /// Parse one document, running backup and repair on failure.
    fn read_document(&self, file: &Path) -> Result<Option<ModelConfig>, StoreError> {
        let bytes = fs::read(file)?;
        let reason = match serde_json::from_slice::<ModelConfig>(&bytes) {
            Ok(config) => return Ok(Some(config)),
            Err(e) => e.to_string(),
        };

        warn!(file = %file.display(), error = %reason, "Corrupt model config");
        let backup = self.backup_file(file)?;

        if let Some(config) = repair(&bytes) {
            let repaired = serde_json::to_vec_pretty(&config)?;
            write_atomic(file, &repaired, validate_config_bytes)?;
            info!(file = %file.display(), backup = %backup.display(), "Repaired model config");
            return Ok(Some(config));
        }

        fs::remove_file(file)?;
        self.note_quarantine(backup, QuarantineReason::Corrupt(reason));
        Ok(None)
    }

    /// No more than one record may stay active; the most recently used wins.
    fn enforce_single_active(&self, entries: &mut BTreeMap<String, Entry>) -> Result<(), StoreError> {
        let mut active: Vec<&String> = entries
            .iter()
            .filter(|(_, e)| e.config.active)
            .map(|(k, _)| k)
            .collect();
        if active.len() <= 1 {
            return Ok(());
        }
        active.sort_by_key(|k| std::cmp::Reverse(entries[*k].config.last_used));
        let demote: Vec<String> = active.iter().skip(1).map(|k| (*k).clone()).collect();
        for key in demote {
            if let Some(entry) = entries.get_mut(&key) {
                warn!(model = %entry.config.name, "Clearing stale active flag");
                entry.config.active = false;
                persist(&entry.file, &entry.config)?;
            }
        }
        Ok(())
    }

    fn backup_file(&self, file: &Path) -> Result<PathBuf, StoreError> {
        let dir = self.invalid_dir();
        fs::create_dir_all(&dir)?;
        let dest = unique_destination(&dir, file);
        fs::copy(file, &dest)?;
        Ok(dest)
    }

    fn quarantine_file(&self, file: &Path) -> Result<PathBuf, StoreError> {
        let dir = self.invalid_dir();
        fs::create_dir_all(&dir)?;
        let dest = unique_destination(&dir, file);
        fs::rename(file, &dest)?;
        Ok(dest)
    }

    fn note_quarantine(&self, file: PathBuf, reason: QuarantineReason) {
        self.quarantined.write().push(QuarantineRecord { file, reason });
    }

    /// Configs moved aside since the store was opened.
    pub fn quarantined(&self) -> Vec<QuarantineRecord> {
        self.quarantined.read().clone()
    }

    pub fn list(&self) -> Vec<ModelConfig> {
        self.entries.read().values().map(|e| e.config.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Result<ModelConfig, StoreError> {
        self.entries
            .read()
            .get(&name_key(name))
            .map(|e| e.config.clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(&name_key(name))
    }

    pub fn find_by_path(&self, path: &Path) -> Option<ModelConfig> {
        let wanted = normalize_path(path);
        self.entries
            .read()
            .values()
            .find(|e| normalize_path(&e.config.path) == wanted)
            .map(|e| e.config.clone())
    }

    pub fn active(&self) -> Option<ModelConfig> {
        self.entries
            .read()
            .values()
            .find(|e| e.config.active)
            .map(|e| e.config.clone())
    }

    /// Insert or replace a config. Saving an active config clears the flag
    /// on every other record.
    pub fn save(&self, mut config: ModelConfig) -> Result<(), StoreError> {
        config.name = config.name.trim().to_string();
        if config.name.is_empty() {
            return Err(StoreError::InvalidName(config.name));
        }
        config.path = normalize_path(&config.path);
        let key = config.key();

        let mut entries = self.entries.write();
        if let Some((_, other)) = entries
            .iter()
            .find(|(k, e)| **k != key && normalize_path(&e.config.path) == config.path)
        {
            return Err(StoreError::Duplicate {
                path: config.path.clone(),
                existing: other.config.name.clone(),
            });
        }

        let file = match entries.get(&key) {
            Some(existing) => existing.file.clone(),
            None => self.fresh_file(&entries, &config.name),
        };
        persist(&file, &config)?;

        if config.active {
            deactivate_others(&mut entries, &key)?;
        }
        entries.insert(key, Entry { config, file });
        Ok(())
    }

    fn fresh_file(&self, entries: &BTreeMap<String, Entry>, name: &str) -> PathBuf {
        let stem = file_stem(name);
        let taken = |p: &PathBuf| entries.values().any(|e| &e.file == p) || p.exists();
        let mut candidate = self.dir.join(format!("{stem}.json"));
        let mut n = 2;
        while taken(&candidate) {
            candidate = self.dir.join(format!("{stem}-{n}.json"));
            n += 1;
        }
        candidate
    }

    /// Remove a config, moving its document to `deleted/`.
    pub fn delete(&self, name: &str) -> Result<PathBuf, StoreError> {
        let key = name_key(name);
        let mut entries = self.entries.write();
        let entry = entries
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let dir = self.deleted_dir();
        fs::create_dir_all(&dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let stem = entry.file.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let dest = dir.join(format!("{stem}.{stamp}.json"));
        fs::rename(&entry.file, &dest)?;

        entries.remove(&key);
        info!(model = %name, backup = %dest.display(), "Model config deleted");
        Ok(dest)
    }

    /// Mark one model active and every other inactive.
    pub fn set_active(&self, name: &str) -> Result<ModelConfig, StoreError> {
        let key = name_key(name);
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if !entry.config.active {
            let mut updated = entry.config.clone();
            updated.active = true;
            persist(&entry.file, &updated)?;
            entry.config = updated;
        }
        let config = entry.config.clone();
        deactivate_others(&mut entries, &key)?;
        Ok(config)
    }

    pub fn clear_active(&self) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        deactivate_others(&mut entries, "")
    }

    /// Bump usage statistics after a successful load.
    pub fn record_use(&self, name: &str) -> Result<ModelConfig, StoreError> {
        self.update(name, |c| {
            c.usage_count = c.usage_count.saturating_add(1);
            c.last_used = Some(Utc::now());
        })
    }

    /// Apply an in-place edit and persist it.
    pub fn update<F>(&self, name: &str, edit: F) -> Result<ModelConfig, StoreError>
    where
        F: FnOnce(&mut ModelConfig),
    {
        let key = name_key(name);
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let mut updated = entry.config.clone();
        edit(&mut updated);
        if name_key(&updated.name) != key {
            return Err(StoreError::InvalidName(updated.name));
        }
        updated.path = normalize_path(&updated.path);
        persist(&entry.file, &updated)?;
        entry.config = updated.clone();
        if updated.active {
            deactivate_others(&mut entries, &key)?;
        }
        Ok(updated)
    }

    /// Merge discovered configs without touching existing records.
    ///
    /// A candidate whose path is already registered is skipped. A candidate
    /// whose name collides with a different path gets a ` (n)` suffix.
    /// Returns the configs that were added.
    pub fn merge_discovered(&self, found: Vec<ModelConfig>) -> Result<Vec<ModelConfig>, StoreError> {
        let mut added = Vec::new();
        for mut candidate in found {
            if self.find_by_path(&candidate.path).is_some() {
                continue;
            }
            let base = candidate.name.clone();
            let mut n = 2;
            while self.contains(&candidate.name) {
                candidate.name = format!("{base} ({n})");
                n += 1;
            }
            candidate.active = false;
            self.save(candidate.clone())?;
            info!(model = %candidate.name, path = %candidate.path.display(), "Discovered model registered");
            added.push(candidate);
        }
        Ok(added)
    }

    /// Configs ordered by usage count, highest first.
    pub fn frequent(&self, limit: usize) -> Vec<ModelConfig> {
        let mut all = self.list();
        all.sort_by(|a, b| b.usage_count.cmp(&a.usage_count).then_with(|| a.key().cmp(&b.key())));
        all.truncate(limit);
        all
    }

    /// Configs ordered by last use, most recent first. Never-used configs are excluded.
    pub fn recent(&self, limit: usize) -> Vec<ModelConfig> {
        let mut all: Vec<ModelConfig> = self.list().into_iter().filter(|c| c.last_used.is_some()).collect();
        all.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        all.truncate(limit);
        all
    }

    /// Quarantine configs whose model file has disappeared since load.
    pub fn cleanup(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.write();
        let missing: Vec<String> = entries
            .iter()
            .filter(|(_, e)| !e.config.is_loadable())
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = Vec::new();
        for key in missing {
            if let Some(entry) = entries.remove(&key) {
                warn!(model = %entry.config.name, path = %entry.config.path.display(), "Model file missing, quarantining config");
                let dest = self.quarantine_file(&entry.file)?;
                self.note_quarantine(dest, QuarantineReason::MissingModelFile(entry.config.path.clone()));
                removed.push(entry.config.name);
            }
        }
        Ok(removed)
    }
}

fn persist(file: &Path, config: &ModelConfig) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(config)?;
    write_atomic(file, &bytes, validate_config_bytes)
}

fn deactivate_others(entries: &mut BTreeMap<String, Entry>, keep: &str) -> Result<(), StoreError> {
    for (key, entry) in entries.iter_mut() {
        if key != keep && entry.config.active {
            let mut updated = entry.config.clone();
            updated.active = false;
            persist(&entry.file, &updated)?;
            entry.config = updated;
        }
    }
    Ok(())
}

fn unique_destination(dir: &Path, file: &Path) -> PathBuf {
    let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let mut dest = dir.join(format!("{name}.{stamp}"));
    let mut n = 1;
    while dest.exists() {
        dest = dir.join(format!("{name}.{stamp}.{n}"));
        n += 1;
    }
    dest
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
