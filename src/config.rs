use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::collectors::{CollectOptions, DEFAULT_TOP_PROCESSES};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub collect: CollectConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_cpu_sample_ms")]
    pub cpu_sample_ms: u64,
    #[serde(default = "default_top_processes")]
    pub top_processes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            token: None,
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            cpu_sample_ms: default_cpu_sample_ms(),
            top_processes: default_top_processes(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upload_dir: default_upload_dir(),
            token: None,
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_upload(&self.upload)?;
        validate_collect(&self.collect)?;
        validate_receiver(&self.receiver)?;
        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl UploadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Token from the environment variable named by `token_env`, then from the file.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_token_with(&self.token_env, self.token.as_deref(), |name| {
            std::env::var(name).ok()
        })
    }
}

impl CollectConfig {
    pub fn options(&self) -> CollectOptions {
        CollectOptions {
            cpu_sample_interval: Duration::from_millis(self.cpu_sample_ms),
            top_process_limit: self.top_processes,
        }
    }
}

fn resolve_token_with(
    env_name: &str,
    file_token: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    let non_empty = |v: String| {
        let v = v.trim().to_string();
        (!v.is_empty()).then_some(v)
    };
    if !env_name.trim().is_empty() {
        if let Some(v) = lookup(env_name).and_then(non_empty) {
            return Some(v);
        }
    }
    file_token.map(str::to_string).and_then(non_empty)
}

fn validate_upload(cfg: &UploadConfig) -> Result<(), ConfigError> {
    let endpoint = cfg.endpoint.trim();
    if endpoint.is_empty() {
        return Err(ConfigError::Validation(
            "поле upload.endpoint обязательно".to_string(),
        ));
    }
    if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
        return Err(ConfigError::Validation(format!(
            "upload.endpoint '{endpoint}' должен начинаться с http:// или https://"
        )));
    }
    if cfg.timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "upload.timeout_secs должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_collect(cfg: &CollectConfig) -> Result<(), ConfigError> {
    if !(100..=10_000).contains(&cfg.cpu_sample_ms) {
        return Err(ConfigError::Validation(
            "collect.cpu_sample_ms должно быть в диапазоне 100..10000".to_string(),
        ));
    }
    if cfg.top_processes < 1 {
        return Err(ConfigError::Validation(
            "collect.top_processes должно быть >= 1".to_string(),
        ));
    }
    if cfg.output_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "collect.output_dir не должен быть пустым".to_string(),
        ));
    }
    Ok(())
}

fn validate_receiver(cfg: &ReceiverConfig) -> Result<(), ConfigError> {
    if SocketAddr::from_str(&cfg.listen).is_err() {
        return Err(ConfigError::Validation(
            "receiver.listen должно быть корректным адресом host:port".to_string(),
        ));
    }
    if cfg.max_upload_bytes < 1 {
        return Err(ConfigError::Validation(
            "receiver.max_upload_bytes должно быть >= 1".to_string(),
        ));
    }
    if cfg.upload_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "receiver.upload_dir не должен быть пустым".to_string(),
        ));
    }
    Ok(())
}

fn default_endpoint() -> String {
    "https://www.example.com/upload".to_string()
}

fn default_token_env() -> String {
    "SYSDUMP_UPLOAD_TOKEN".to_string()
}

const fn default_timeout_secs() -> u64 {
    30
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

const fn default_cpu_sample_ms() -> u64 {
    1000
}

const fn default_top_processes() -> usize {
    DEFAULT_TOP_PROCESSES
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

const fn default_max_upload_bytes() -> u64 {
    5 * 1024 * 1024
}
