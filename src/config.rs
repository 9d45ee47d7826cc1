//! Configuration loader and validator for the scanner.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub remote: Remote,
    pub scan: Scan,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Overrides the default `sqlite://<data_dir>/tgcloud.db`.
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Remote service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    pub user_agent: String,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Scan engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scan {
    pub workers: usize,
    pub request_interval_ms: u64,
    pub batch_delay_ms: u64,
    pub join_timeout_ms: u64,
    pub drain_poll_ms: u64,
    pub drain_timeout_ms: u64,
}

fn default_page_limit() -> u32 {
    100
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the file, which wins over the data_dir default.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| {
                format!(
                    "sqlite://{}/tgcloud.db",
                    self.app.data_dir.trim_end_matches('/')
                )
            })
    }
}

impl Scan {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if let Some(url) = &cfg.app.database_url {
        if url.trim().is_empty() {
            return Err(ConfigError::Invalid("app.database_url must be non-empty when set"));
        }
    }

    if Url::parse(&cfg.remote.base_url).is_err() {
        return Err(ConfigError::Invalid("remote.base_url must be a valid URL"));
    }
    if cfg.remote.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.user_agent must be non-empty"));
    }
    if cfg.remote.page_limit == 0 {
        return Err(ConfigError::Invalid("remote.page_limit must be > 0"));
    }

    if cfg.scan.workers == 0 {
        return Err(ConfigError::Invalid("scan.workers must be > 0"));
    }
    // request_interval_ms and batch_delay_ms may be 0
    if cfg.scan.join_timeout_ms == 0 {
        return Err(ConfigError::Invalid("scan.join_timeout_ms must be > 0"));
    }
    if cfg.scan.drain_poll_ms == 0 {
        return Err(ConfigError::Invalid("scan.drain_poll_ms must be > 0"));
    }
    if cfg.scan.drain_timeout_ms == 0 {
        return Err(ConfigError::Invalid("scan.drain_timeout_ms must be > 0"));
    }

    Ok(())
}

/// Returns the reference YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

remote:
  base_url: "http://konk.cc/"
  user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
  page_limit: 100
  accept_invalid_certs: true

scan:
  workers: 3
  request_interval_ms: 1000
  batch_delay_ms: 1000
  join_timeout_ms: 5000
  drain_poll_ms: 100
  drain_timeout_ms: 3000
"#
}
