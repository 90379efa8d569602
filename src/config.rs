//! Gateway configuration.
//!
//! Values come from three layers, later ones winning: built-in defaults, a
//! TOML file, then `LLM_GATEWAY_*` environment variables. Unparseable
//! environment values fall back to whatever the earlier layers produced.
//! Unknown keys in the file are rejected.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `LLM_GATEWAY_CONFIG` | unset | Config file read when none is given explicitly |
//! | `LLM_GATEWAY_MODEL_DIRS` | `models` | Model roots, separated like `PATH` |
//! | `LLM_GATEWAY_MODEL_EXTENSION` | `gguf` | Extension of model files |
//! | `LLM_GATEWAY_MEMORY_BUDGET` | unset | Memory budget when no device probe exists (bytes) |
//! | `LLM_GATEWAY_SHUTDOWN_TIMEOUT` | 30 | Graceful shutdown timeout (secs) |
//! | `LLM_GATEWAY_N_CTX` | 4096 | GGUF context window size |
//! | `LLM_GATEWAY_N_THREADS` | 0 | Inference threads (0 = auto) |
//! | `LLM_GATEWAY_LOG_LEVEL` | info | `EnvFilter` directive |
//! | `LLM_GATEWAY_LOG_FORMAT` | json | `json` or `pretty` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::telemetry::{LogConfig, LogFormat};

pub const CONFIG_ENV: &str = "LLM_GATEWAY_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Fixed budget used when no accelerator reports memory.
    pub budget_bytes: Option<u64>,
}

/// Settings handed to the GGUF backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GgufSettings {
    pub n_ctx: u32,
    pub n_threads: u32,
    pub seed: u32,
}

impl Default for GgufSettings {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_threads: 0,
            seed: 42,
        }
    }
}

#[cfg(feature = "gguf")]
impl From<&GgufSettings> for crate::engine::gguf::GgufConfig {
    fn from(settings: &GgufSettings) -> Self {
        Self {
            n_ctx: settings.n_ctx,
            n_threads: settings.n_threads,
            seed: settings.seed,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub model_dirs: Vec<PathBuf>,
    pub model_extension: String,
    pub shutdown_timeout_secs: u64,
    pub memory: MemoryConfig,
    pub gguf: GgufSettings,
    pub log: LogConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            model_dirs: vec![PathBuf::from("models")],
            model_extension: "gguf".to_string(),
            shutdown_timeout_secs: 30,
            memory: MemoryConfig::default(),
            gguf: GgufSettings::default(),
            log: LogConfig::default(),
        }
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Non-empty string env var.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl GatewayConfig {
    /// Defaults, then `path` (or `LLM_GATEWAY_CONFIG`), then env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| env_string(CONFIG_ENV).map(PathBuf::from));
        let mut config = match file {
            Some(file) => Self::from_file(&file)?,
            None => Self::default(),
        };
        config.apply_env();
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self) {
        if let Some(dirs) = std::env::var_os("LLM_GATEWAY_MODEL_DIRS") {
            let dirs: Vec<PathBuf> = std::env::split_paths(&dirs)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !dirs.is_empty() {
                self.model_dirs = dirs;
            }
        }
        if let Some(ext) = env_string("LLM_GATEWAY_MODEL_EXTENSION") {
            self.model_extension = ext;
        }
        if let Some(budget) = env_string("LLM_GATEWAY_MEMORY_BUDGET") {
            if let Ok(budget) = budget.parse::<u64>() {
                self.memory.budget_bytes = Some(budget);
            }
        }
        self.shutdown_timeout_secs =
            parse_u64("LLM_GATEWAY_SHUTDOWN_TIMEOUT", self.shutdown_timeout_secs);
        self.gguf.n_ctx = parse_u32("LLM_GATEWAY_N_CTX", self.gguf.n_ctx);
        self.gguf.n_threads = parse_u32("LLM_GATEWAY_N_THREADS", self.gguf.n_threads);
        if let Some(level) = env_string("LLM_GATEWAY_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(format) = env_string("LLM_GATEWAY_LOG_FORMAT") {
            if let Ok(format) = format.parse::<LogFormat>() {
                self.log.format = format;
            }
        }
    }

    fn normalize(&mut self) {
        self.model_extension = self.model_extension.trim_start_matches('.').to_string();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_dirs.is_empty() {
            return Err(ConfigError::Invalid("model_dirs must name at least one directory".into()));
        }
        if self.model_extension.trim_start_matches('.').is_empty() {
            return Err(ConfigError::Invalid("model_extension must not be empty".into()));
        }
        if self.gguf.n_ctx == 0 {
            return Err(ConfigError::Invalid("gguf.n_ctx must be positive".into()));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Effective configuration rendered back as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
