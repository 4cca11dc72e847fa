use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use url::Url;

/// Upper bound on a saved config file.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;
pub const MAX_WORKER_URL_LEN: usize = 2048;
pub const DEFAULT_WORKER_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_CACHE_DIR: &str = "cache";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedClientConfig {
    #[serde(default = "default_worker_url")]
    pub worker_url: String,
    /// Run the worker in-process instead of connecting to `worker_url`.
    #[serde(default)]
    pub local: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for SavedClientConfig {
    fn default() -> Self {
        Self {
            worker_url: default_worker_url(),
            local: false,
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_worker_url() -> String {
    DEFAULT_WORKER_URL.to_owned()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

#[derive(Debug)]
pub enum ConfigLoadError {
    Metadata(io::Error),
    TooLarge { size: u64, max: u64 },
    Read(io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLoadError::Metadata(e) => write!(f, "metadata read failed: {e}"),
            ConfigLoadError::TooLarge { size, max } => {
                write!(f, "file too large: {size} bytes (max {max})")
            }
            ConfigLoadError::Read(e) => write!(f, "read failed: {e}"),
            ConfigLoadError::Parse(e) => write!(f, "parse failed: {e}"),
            ConfigLoadError::Invalid(reason) => write!(f, "invalid config: {reason}"),
        }
    }
}

impl std::error::Error for ConfigLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigLoadError::Metadata(e) => Some(e),
            ConfigLoadError::Read(e) => Some(e),
            ConfigLoadError::Parse(e) => Some(e),
            ConfigLoadError::TooLarge { .. } | ConfigLoadError::Invalid(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigSaveError {
    Serialize(serde_json::Error),
    WriteTmp(io::Error),
    Rename(io::Error),
}

impl std::fmt::Display for ConfigSaveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSaveError::Serialize(e) => write!(f, "serialize failed: {e}"),
            ConfigSaveError::WriteTmp(e) => write!(f, "tmp write failed: {e}"),
            ConfigSaveError::Rename(e) => write!(f, "rename failed: {e}"),
        }
    }
}

impl std::error::Error for ConfigSaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigSaveError::Serialize(e) => Some(e),
            ConfigSaveError::WriteTmp(e) => Some(e),
            ConfigSaveError::Rename(e) => Some(e),
        }
    }
}

pub fn validate_worker_url(worker_url: &str) -> Result<(), String> {
    let trimmed = worker_url.trim();
    if trimmed.is_empty() {
        return Err("worker URL must not be empty".to_owned());
    }
    if trimmed.len() > MAX_WORKER_URL_LEN {
        return Err(format!("worker URL exceeds {MAX_WORKER_URL_LEN} bytes"));
    }
    let url = Url::parse(trimmed).map_err(|err| format!("worker URL is invalid: {err}"))?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(format!("worker URL must use ws or wss, got {other}")),
    }
}

pub fn validate_config(config: &SavedClientConfig) -> Result<(), String> {
    if !config.local {
        validate_worker_url(&config.worker_url)?;
    }
    if config.cache_dir.as_os_str().is_empty() {
        return Err("cache dir must not be empty".to_owned());
    }
    Ok(())
}

pub fn parse_config_json(data: &str) -> Result<SavedClientConfig, serde_json::Error> {
    serde_json::from_str::<SavedClientConfig>(data)
}

pub fn load_config_from_path(path: &Path) -> Result<SavedClientConfig, ConfigLoadError> {
    let meta = fs::metadata(path).map_err(ConfigLoadError::Metadata)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigLoadError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigLoadError::Read)?;
    let config = parse_config_json(&data).map_err(ConfigLoadError::Parse)?;
    validate_config(&config).map_err(ConfigLoadError::Invalid)?;
    Ok(config)
}

pub fn save_config_to_path(path: &Path, config: &SavedClientConfig) -> Result<(), ConfigSaveError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(config).map_err(ConfigSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(ConfigSaveError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(ConfigSaveError::Rename)?;
    Ok(())
}
