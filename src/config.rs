//! Orchestrator configuration.
//!
//! Layered as built-in defaults, then an optional TOML file, then
//! `GG_ORCH_*` environment variables. Invalid environment values fall back
//! to the layer below without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_ORCH_CONFIG` | unset | Path to a TOML config file |
//! | `GG_ORCH_CONFIG_DIR` | `./configs` | Model config directory |
//! | `GG_ORCH_MODEL_ROOTS` | unset | Discovery roots (platform path list) |
//! | `GG_ORCH_MIN_MODEL_SIZE` | 1048576 | Smallest file discovery considers (bytes) |
//! | `GG_ORCH_MAX_LOAD_ATTEMPTS` | 3 | Failure budget per model |
//! | `GG_ORCH_FALLBACK_BOUND` | 2 | Synchronous fallback candidates |
//! | `GG_ORCH_SERVER_ESCALATION` | true | Retry direct failures through llama-server |
//! | `GG_ORCH_WARMUP_CAPACITY` | 1 | Background warm-up candidates |
//! | `GG_ORCH_SERVER_BIN` | unset | llama-server executable |
//! | `GG_ORCH_SERVER_HOST` | 127.0.0.1 | llama-server bind host |
//! | `GG_ORCH_SERVER_PORT` | 8080 | llama-server port |
//! | `GG_ORCH_HEALTH_INTERVAL_MS` | 1000 | Health poll interval |
//! | `GG_ORCH_HEALTH_ATTEMPTS` | 30 | Health poll attempts |
//! | `GG_ORCH_PROBE_TIMEOUT_MS` | 2000 | Single health probe timeout |
//! | `GG_ORCH_GENERATION_TIMEOUT` | 120 | Server generation timeout (secs) |
//! | `GG_ORCH_TERMINATE_TIMEOUT` | 5 | Graceful terminate timeout (secs) |
//! | `GG_ORCH_REMOTE_URL` | `https://api.openai.com/v1` | Remote API base URL |
//! | `GG_ORCH_REMOTE_KEY_ENV` | `OPENAI_API_KEY` | Env var holding the remote API key |
//! | `GG_ORCH_VRAM_TIER` | medium | low / medium / high / ultra |
//! | `GG_ORCH_N_THREADS` | 0 | Native inference threads (0 = auto) |
//! | `GG_ORCH_LOG_FORMAT` | json | json / pretty |
//! | `GG_ORCH_LOG_LEVEL` | info | tracing filter directive |
//! | `GG_ORCH_LOG_FILE` | unset | Log file path |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::sizing::VramTier;
use crate::telemetry::{LogConfig, LogFormat};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub config_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    pub roots: Vec<PathBuf>,
    pub min_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadingConfig {
    /// Consecutive failures after which a model is skipped by fallback.
    pub max_load_attempts: u32,
    /// Candidates tried synchronously by `load_with_fallback`.
    pub fallback_attempt_bound: usize,
    pub allow_server_escalation: bool,
    pub warmup_capacity: usize,
    pub preload_error_capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub executable: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub health_interval: Duration,
    pub health_attempts: u32,
    pub probe_timeout: Duration,
    pub generation_timeout: Duration,
    pub terminate_timeout: Duration,
    pub parallel: Option<u32>,
    pub threads: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectConfig {
    pub n_threads: u32,
    pub generation_timeout: Duration,
}

/// All orchestrator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub store: StoreConfig,
    pub discovery: DiscoveryConfig,
    pub loading: LoadingConfig,
    pub server: ServerConfig,
    pub remote: RemoteConfig,
    pub direct: DirectConfig,
    pub vram_tier: VramTier,
    pub logging: LogConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { config_dir: PathBuf::from("configs") }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { roots: Vec::new(), min_size_bytes: 1024 * 1024 }
    }
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            max_load_attempts: 3,
            fallback_attempt_bound: 2,
            allow_server_escalation: true,
            warmup_capacity: 1,
            preload_error_capacity: 32,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            host: "127.0.0.1".to_string(),
            port: 8080,
            health_interval: Duration::from_millis(1000),
            health_attempts: 30,
            probe_timeout: Duration::from_millis(2000),
            generation_timeout: Duration::from_secs(120),
            terminate_timeout: Duration::from_secs(5),
            parallel: None,
            threads: None,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self { n_threads: 0, generation_timeout: Duration::from_secs(300) }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            discovery: DiscoveryConfig::default(),
            loading: LoadingConfig::default(),
            server: ServerConfig::default(),
            remote: RemoteConfig::default(),
            direct: DirectConfig::default(),
            vram_tier: VramTier::default(),
            logging: LogConfig::default(),
        }
    }
}

/// On-disk TOML shape. Every field is optional and overlays the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    store: FileStore,
    discovery: FileDiscovery,
    loading: FileLoading,
    server: FileServer,
    remote: FileRemote,
    direct: FileDirect,
    sizing: FileSizing,
    logging: FileLogging,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileStore {
    config_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileDiscovery {
    roots: Option<Vec<PathBuf>>,
    min_size_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileLoading {
    max_load_attempts: Option<u32>,
    fallback_attempt_bound: Option<usize>,
    allow_server_escalation: Option<bool>,
    warmup_capacity: Option<usize>,
    preload_error_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileServer {
    executable: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    health_interval_ms: Option<u64>,
    health_attempts: Option<u32>,
    probe_timeout_ms: Option<u64>,
    generation_timeout_secs: Option<u64>,
    terminate_timeout_secs: Option<u64>,
    parallel: Option<u32>,
    threads: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileRemote {
    base_url: Option<String>,
    api_key_env: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileDirect {
    n_threads: Option<u32>,
    generation_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSizing {
    vram_tier: Option<VramTier>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileLogging {
    format: Option<LogFormat>,
    level: Option<String>,
    file: Option<PathBuf>,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn parse_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl OrchestratorConfig {
    fn apply_file(&mut self, file: FileConfig) {
        if let Some(dir) = file.store.config_dir {
            self.store.config_dir = dir;
        }

        if let Some(roots) = file.discovery.roots {
            self.discovery.roots = roots;
        }
        if let Some(min) = file.discovery.min_size_bytes {
            self.discovery.min_size_bytes = min;
        }

        let l = file.loading;
        let loading = &mut self.loading;
        loading.max_load_attempts = l.max_load_attempts.unwrap_or(loading.max_load_attempts);
        loading.fallback_attempt_bound =
            l.fallback_attempt_bound.unwrap_or(loading.fallback_attempt_bound);
        loading.allow_server_escalation =
            l.allow_server_escalation.unwrap_or(loading.allow_server_escalation);
        loading.warmup_capacity = l.warmup_capacity.unwrap_or(loading.warmup_capacity);
        loading.preload_error_capacity =
            l.preload_error_capacity.unwrap_or(loading.preload_error_capacity);

        let s = file.server;
        let server = &mut self.server;
        if s.executable.is_some() {
            server.executable = s.executable;
        }
        if let Some(host) = s.host {
            server.host = host;
        }
        server.port = s.port.unwrap_or(server.port);
        if let Some(ms) = s.health_interval_ms {
            server.health_interval = Duration::from_millis(ms);
        }
        server.health_attempts = s.health_attempts.unwrap_or(server.health_attempts);
        if let Some(ms) = s.probe_timeout_ms {
            server.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = s.generation_timeout_secs {
            server.generation_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = s.terminate_timeout_secs {
            server.terminate_timeout = Duration::from_secs(secs);
        }
        if s.parallel.is_some() {
            server.parallel = s.parallel;
        }
        if s.threads.is_some() {
            server.threads = s.threads;
        }

        if let Some(url) = file.remote.base_url {
            self.remote.base_url = url;
        }
        if let Some(key_env) = file.remote.api_key_env {
            self.remote.api_key_env = key_env;
        }
        if let Some(secs) = file.remote.timeout_secs {
            self.remote.timeout = Duration::from_secs(secs);
        }

        self.direct.n_threads = file.direct.n_threads.unwrap_or(self.direct.n_threads);
        if let Some(secs) = file.direct.generation_timeout_secs {
            self.direct.generation_timeout = Duration::from_secs(secs);
        }

        if let Some(tier) = file.sizing.vram_tier {
            self.vram_tier = tier;
        }

        if let Some(format) = file.logging.format {
            self.logging.format = format;
        }
        if let Some(level) = file.logging.level {
            self.logging.level = level;
        }
        if file.logging.file.is_some() {
            self.logging.output_path = file.logging.file;
        }
    }

    fn apply_env(&mut self) {
        if let Some(dir) = parse_string("GG_ORCH_CONFIG_DIR") {
            self.store.config_dir = PathBuf::from(dir);
        }
        if let Some(roots) = std::env::var_os("GG_ORCH_MODEL_ROOTS") {
            let roots: Vec<PathBuf> = std::env::split_paths(&roots)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !roots.is_empty() {
                self.discovery.roots = roots;
            }
        }
        self.discovery.min_size_bytes =
            parse_u64("GG_ORCH_MIN_MODEL_SIZE", self.discovery.min_size_bytes);

        let loading = &mut self.loading;
        loading.max_load_attempts =
            parse_u32("GG_ORCH_MAX_LOAD_ATTEMPTS", loading.max_load_attempts);
        loading.fallback_attempt_bound =
            parse_usize("GG_ORCH_FALLBACK_BOUND", loading.fallback_attempt_bound);
        loading.allow_server_escalation =
            parse_bool("GG_ORCH_SERVER_ESCALATION", loading.allow_server_escalation);
        loading.warmup_capacity = parse_usize("GG_ORCH_WARMUP_CAPACITY", loading.warmup_capacity);

        let server = &mut self.server;
        if let Some(bin) = parse_string("GG_ORCH_SERVER_BIN") {
            server.executable = Some(PathBuf::from(bin));
        }
        if let Some(host) = parse_string("GG_ORCH_SERVER_HOST") {
            server.host = host;
        }
        server.port = u16::try_from(parse_u32("GG_ORCH_SERVER_PORT", u32::from(server.port)))
            .unwrap_or(server.port);
        let interval = duration_ms(server.health_interval);
        server.health_interval =
            Duration::from_millis(parse_u64("GG_ORCH_HEALTH_INTERVAL_MS", interval));
        server.health_attempts = parse_u32("GG_ORCH_HEALTH_ATTEMPTS", server.health_attempts);
        let probe = duration_ms(server.probe_timeout);
        server.probe_timeout = Duration::from_millis(parse_u64("GG_ORCH_PROBE_TIMEOUT_MS", probe));
        server.generation_timeout = Duration::from_secs(parse_u64(
            "GG_ORCH_GENERATION_TIMEOUT",
            server.generation_timeout.as_secs(),
        ));
        server.terminate_timeout = Duration::from_secs(parse_u64(
            "GG_ORCH_TERMINATE_TIMEOUT",
            server.terminate_timeout.as_secs(),
        ));

        if let Some(url) = parse_string("GG_ORCH_REMOTE_URL") {
            self.remote.base_url = url;
        }
        if let Some(key_env) = parse_string("GG_ORCH_REMOTE_KEY_ENV") {
            self.remote.api_key_env = key_env;
        }

        if let Some(tier) = parse_string("GG_ORCH_VRAM_TIER") {
            if let Ok(tier) = tier.parse::<VramTier>() {
                self.vram_tier = tier;
            }
        }
        self.direct.n_threads = parse_u32("GG_ORCH_N_THREADS", self.direct.n_threads);

        if let Some(format) = parse_string("GG_ORCH_LOG_FORMAT") {
            if let Ok(format) = format.parse::<LogFormat>() {
                self.logging.format = format;
            }
        }
        if let Some(level) = parse_string("GG_ORCH_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(file) = parse_string("GG_ORCH_LOG_FILE") {
            self.logging.output_path = Some(PathBuf::from(file));
        }
    }

    /// Apply floors so no value can produce an unbounded or empty loop.
    fn clamp(&mut self) {
        let loading = &mut self.loading;
        loading.max_load_attempts = loading.max_load_attempts.max(1);
        loading.fallback_attempt_bound = loading.fallback_attempt_bound.max(1);
        loading.preload_error_capacity = loading.preload_error_capacity.max(1);

        let server = &mut self.server;
        server.health_interval = server.health_interval.max(Duration::from_millis(10));
        server.health_attempts = server.health_attempts.max(1);
        server.probe_timeout = server.probe_timeout.max(Duration::from_millis(50));
        // Generation must outlast a liveness probe.
        server.generation_timeout = server.generation_timeout.max(server.probe_timeout);
        server.terminate_timeout = server.terminate_timeout.max(Duration::from_millis(100));
        self.remote.timeout = self.remote.timeout.max(Duration::from_secs(1));
        self.direct.generation_timeout = self.direct.generation_timeout.max(Duration::from_secs(1));
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Parse a TOML document onto the defaults (no environment overlay).
pub fn from_toml_str(text: &str) -> Result<OrchestratorConfig, toml::de::Error> {
    let file: FileConfig = toml::from_str(text)?;
    let mut config = OrchestratorConfig::default();
    config.apply_file(file);
    config.clamp();
    Ok(config)
}

/// Load configuration from an optional file plus the environment.
pub fn load_from(path: Option<&Path>) -> Result<OrchestratorConfig, ConfigError> {
    let mut config = OrchestratorConfig::default();

    if let Some(path) = path {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.apply_file(file);
    }

    config.apply_env();
    config.clamp();
    Ok(config)
}

/// Load configuration, reading the file named by `GG_ORCH_CONFIG` if set.
pub fn load() -> Result<OrchestratorConfig, ConfigError> {
    let path = parse_string("GG_ORCH_CONFIG").map(PathBuf::from);
    load_from(path.as_deref())
}

/// Effective configuration summary for display.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub config_dir: String,
    pub model_roots: Vec<String>,
    pub max_load_attempts: u32,
    pub fallback_attempt_bound: usize,
    pub allow_server_escalation: bool,
    pub warmup_capacity: usize,
    pub server_executable: Option<String>,
    pub server_addr: String,
    pub health_interval_ms: u64,
    pub health_attempts: u32,
    pub generation_timeout_secs: u64,
    pub terminate_timeout_secs: u64,
    pub remote_base_url: String,
    pub vram_tier: &'static str,
    pub n_threads: u32,
    pub log_level: String,
}

pub fn effective_config(config: &OrchestratorConfig) -> EffectiveConfig {
    EffectiveConfig {
        config_dir: config.store.config_dir.display().to_string(),
        model_roots: config.discovery.roots.iter().map(|p| p.display().to_string()).collect(),
        max_load_attempts: config.loading.max_load_attempts,
        fallback_attempt_bound: config.loading.fallback_attempt_bound,
        allow_server_escalation: config.loading.allow_server_escalation,
        warmup_capacity: config.loading.warmup_capacity,
        server_executable: config.server.executable.as_ref().map(|p| p.display().to_string()),
        server_addr: format!("{}:{}", config.server.host, config.server.port),
        health_interval_ms: duration_ms(config.server.health_interval),
        health_attempts: config.server.health_attempts,
        generation_timeout_secs: config.server.generation_timeout.as_secs(),
        terminate_timeout_secs: config.server.terminate_timeout.as_secs(),
        remote_base_url: config.remote.base_url.clone(),
        vram_tier: config.vram_tier.as_str(),
        n_threads: config.direct.n_threads,
        log_level: config.logging.level.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "GG_ORCH_CONFIG",
        "GG_ORCH_CONFIG_DIR",
        "GG_ORCH_MODEL_ROOTS",
        "GG_ORCH_MAX_LOAD_ATTEMPTS",
        "GG_ORCH_FALLBACK_BOUND",
        "GG_ORCH_SERVER_ESCALATION",
        "GG_ORCH_SERVER_PORT",
        "GG_ORCH_HEALTH_ATTEMPTS",
        "GG_ORCH_HEALTH_INTERVAL_MS",
        "GG_ORCH_VRAM_TIER",
        "GG_ORCH_LOG_FORMAT",
    ];

    fn clear_env_vars() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults_without_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let config = load_from(None).unwrap();
        assert_eq!(config.loading.max_load_attempts, 3);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.health_attempts, 30);
        assert_eq!(config.vram_tier, VramTier::Medium);
    }

    #[test]
    fn test_env_overrides_and_invalid_fallback() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_ORCH_MAX_LOAD_ATTEMPTS", "5");
        std::env::set_var("GG_ORCH_SERVER_PORT", "not-a-port");
        std::env::set_var("GG_ORCH_SERVER_ESCALATION", "off");
        std::env::set_var("GG_ORCH_VRAM_TIER", "ultra");
        let config = load_from(None).unwrap();
        assert_eq!(config.loading.max_load_attempts, 5);
        assert_eq!(config.server.port, 8080);
        assert!(!config.loading.allow_server_escalation);
        assert_eq!(config.vram_tier, VramTier::Ultra);
        clear_env_vars();
    }

    #[test]
    fn test_floors_applied() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_ORCH_MAX_LOAD_ATTEMPTS", "0");
        std::env::set_var("GG_ORCH_HEALTH_ATTEMPTS", "0");
        std::env::set_var("GG_ORCH_HEALTH_INTERVAL_MS", "1");
        let config = load_from(None).unwrap();
        assert_eq!(config.loading.max_load_attempts, 1);
        assert_eq!(config.server.health_attempts, 1);
        assert_eq!(config.server.health_interval, Duration::from_millis(10));
        clear_env_vars();
    }

    #[test]
    fn test_toml_overlay() {
        let config = from_toml_str(
            r#"
            [loading]
            max_load_attempts = 4

            [server]
            port = 9090
            health_interval_ms = 250

            [sizing]
            vram_tier = "high"

            [logging]
            format = "pretty"
            "#,
        )
        .unwrap();
        assert_eq!(config.loading.max_load_attempts, 4);
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.health_interval, Duration::from_millis(250));
        assert_eq!(config.vram_tier, VramTier::High);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_unknown_section_rejected() {
        assert!(from_toml_str("[ipc]\nframe_limit = 4").is_err());
    }
}
