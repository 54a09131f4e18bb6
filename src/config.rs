//! Configuration loader and validator for the photo sync service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::DEFAULT_SYNC_TYPE;
use crate::retry::RetryConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub server: Server,
    pub unsplash: Unsplash,
    pub r2: R2,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_sync_type")]
    pub sync_type: String,
}

/// Operator HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub bind: String,
    pub allowed_origin: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".into(),
            allowed_origin: "*".into(),
        }
    }
}

/// Unsplash API settings. `access_key` is normally supplied by `UNSPLASH_ACCESS_KEY`.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Unsplash {
    #[serde(default = "default_unsplash_url")]
    pub api_url: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default = "default_order_by")]
    pub order_by: String,
}

/// R2 (S3-compatible) bucket settings.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct R2 {
    #[serde(default)]
    pub endpoint_url: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub public_url_prefix: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
}

/// Workflow seed values and storage defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    pub batch_size: u32,
    pub wait_seconds: u64,
    pub default_category: String,
    pub default_extension: String,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 30,
            wait_seconds: 60,
            default_category: "uncategorized".into(),
            default_extension: ".jpg".into(),
            max_duration_secs: None,
            retry: RetryConfig::default(),
        }
    }
}

fn default_sync_type() -> String {
    DEFAULT_SYNC_TYPE.to_string()
}

fn default_unsplash_url() -> String {
    "https://api.unsplash.com".to_string()
}

fn default_order_by() -> String {
    "oldest".to_string()
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        "[unset]"
    } else {
        "[REDACTED]"
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("app", &self.app)
            .field("server", &self.server)
            .field("unsplash", &self.unsplash)
            .field("r2", &self.r2)
            .field("sync", &self.sync)
            .finish()
    }
}

impl std::fmt::Debug for Unsplash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsplash")
            .field("api_url", &self.api_url)
            .field("access_key", &redact(&self.access_key))
            .field("order_by", &self.order_by)
            .finish()
    }
}

impl std::fmt::Debug for R2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("R2")
            .field("endpoint_url", &self.endpoint_url)
            .field("bucket", &self.bucket)
            .field("public_url_prefix", &self.public_url_prefix)
            .field("access_key_id", &redact(&self.access_key_id))
            .field("secret_access_key", &redact(&self.secret_access_key))
            .finish()
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// SQLite URL from `DATABASE_URL`, or a database file under the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/imgu-sync.db", self.app.resolved_data_dir()))
    }

    /// Overlay secrets and deployment values from the environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |name: &str, target: &mut String| {
            if let Some(value) = lookup(name).filter(|v| !v.trim().is_empty()) {
                *target = value;
            }
        };
        pick("UNSPLASH_ACCESS_KEY", &mut self.unsplash.access_key);
        pick("R2_ACCESS_KEY_ID", &mut self.r2.access_key_id);
        pick("R2_SECRET_ACCESS_KEY", &mut self.r2.secret_access_key);
        pick("R2_BUCKET_NAME", &mut self.r2.bucket);
        pick("R2_ENDPOINT_URL", &mut self.r2.endpoint_url);
        pick("R2_PUBLIC_URL_PREFIX", &mut self.r2.public_url_prefix);
        self.r2.public_url_prefix = self.r2.public_url_prefix.trim_end_matches('/').to_string();
    }
}

/// Load configuration from a YAML file, overlay the process environment and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides(|name| std::env::var(name).ok());
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sync_type.trim().is_empty() {
        return Err(ConfigError::Invalid("app.sync_type must be non-empty"));
    }
    if cfg.server.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("server.bind must be non-empty"));
    }

    if cfg.unsplash.api_url.trim().is_empty() {
        return Err(ConfigError::Invalid("unsplash.api_url must be non-empty"));
    }
    if cfg.unsplash.access_key.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "unsplash.access_key must be set (or UNSPLASH_ACCESS_KEY)",
        ));
    }

    if cfg.r2.endpoint_url.trim().is_empty() {
        return Err(ConfigError::Invalid("r2.endpoint_url must be set (or R2_ENDPOINT_URL)"));
    }
    if cfg.r2.bucket.trim().is_empty() {
        return Err(ConfigError::Invalid("r2.bucket must be set (or R2_BUCKET_NAME)"));
    }
    if cfg.r2.public_url_prefix.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "r2.public_url_prefix must be set (or R2_PUBLIC_URL_PREFIX)",
        ));
    }
    if cfg.r2.access_key_id.trim().is_empty() {
        return Err(ConfigError::Invalid("r2.access_key_id must be set (or R2_ACCESS_KEY_ID)"));
    }
    if cfg.r2.secret_access_key.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "r2.secret_access_key must be set (or R2_SECRET_ACCESS_KEY)",
        ));
    }

    if cfg.sync.batch_size == 0 {
        return Err(ConfigError::Invalid("sync.batch_size must be > 0"));
    }
    if cfg.sync.default_category.trim().is_empty() {
        return Err(ConfigError::Invalid("sync.default_category must be non-empty"));
    }
    if !cfg.sync.default_extension.starts_with('.') || cfg.sync.default_extension.len() < 2 {
        return Err(ConfigError::Invalid(
            "sync.default_extension must look like \".jpg\"",
        ));
    }
    if cfg.sync.max_duration_secs == Some(0) {
        return Err(ConfigError::Invalid("sync.max_duration_secs must be > 0 when set"));
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sync_type: "UNSPLASH_OLDEST_SYNC"

server:
  bind: "0.0.0.0:3000"
  allowed_origin: "*"

unsplash:
  api_url: "https://api.unsplash.com"
  access_key: "YOUR_UNSPLASH_ACCESS_KEY"
  order_by: "oldest"

r2:
  endpoint_url: "https://ACCOUNT_ID.r2.cloudflarestorage.com"
  bucket: "imgu"
  public_url_prefix: "https://images.example.com"
  access_key_id: "YOUR_R2_ACCESS_KEY_ID"
  secret_access_key: "YOUR_R2_SECRET_ACCESS_KEY"

sync:
  batch_size: 30
  wait_seconds: 60
  default_category: "uncategorized"
  default_extension: ".jpg"
  retry:
    max_retries: 2
    base_delay_secs: 5
    max_delay_secs: 60
"#
}
