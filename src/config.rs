//! Configuration loader and validator for the MID onboarding pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::credentials::{CredentialProvider, SecretDirCredentials, StaticCredentials};
use crate::queue::RetryPolicy;

/// Upper bound for queue retry intervals and the job lease.
pub const MAX_QUEUE_DELAY_SECS: u64 = 7 * 24 * 60 * 60;

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
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub queue: Queue,
    pub amex: Amex,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Worker sleep when the queue has nothing due.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Store {
    /// Defaults to `sqlite://{data_dir}/mid_onboard.db`.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            database_url: None,
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    /// Defaults to `sqlite://{data_dir}/queue.db`.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_intervals")]
    pub retry_intervals_secs: Vec<u64>,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            database_url: None,
            name: default_queue_name(),
            max_retries: default_max_retries(),
            retry_intervals_secs: default_retry_intervals(),
            lease_seconds: default_lease_seconds(),
        }
    }
}

impl Queue {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_secs(self.max_retries, &self.retry_intervals_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Amex {
    pub api_host: String,
    /// Fail a call instead of sending it without a TLS client certificate.
    #[serde(default)]
    pub require_client_cert: bool,
    pub credentials: Credentials,
}

/// Where partner credentials come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Credentials {
    Static {
        #[serde(default)]
        client_id: String,
        #[serde(default)]
        client_secret: String,
        #[serde(default)]
        key_path: Option<PathBuf>,
        #[serde(default)]
        cert_path: Option<PathBuf>,
    },
    SecretDir {
        path: PathBuf,
    },
}

impl Credentials {
    pub fn provider(&self) -> Arc<dyn CredentialProvider> {
        match self {
            Credentials::Static {
                client_id,
                client_secret,
                key_path,
                cert_path,
            } => {
                let creds = StaticCredentials::new(client_id.clone(), client_secret.clone());
                match (key_path, cert_path) {
                    (Some(key), Some(cert)) => {
                        Arc::new(creds.with_identity_files(key.clone(), cert.clone()))
                    }
                    _ => Arc::new(creds),
                }
            }
            Credentials::SecretDir { path } => Arc::new(SecretDirCredentials::new(path.clone())),
        }
    }
}

fn default_busy_timeout_secs() -> u64 {
    30
}

fn default_queue_name() -> String {
    "amex".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_intervals() -> Vec<u64> {
    vec![10, 30, 60]
}

fn default_lease_seconds() -> u64 {
    300
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn store_url(&self) -> String {
        self.store
            .database_url
            .clone()
            .unwrap_or_else(|| format!("sqlite://{}/mid_onboard.db", self.app.data_dir))
    }

    pub fn queue_url(&self) -> String {
        self.queue
            .database_url
            .clone()
            .unwrap_or_else(|| format!("sqlite://{}/queue.db", self.app.data_dir))
    }

    /// Apply environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.store.database_url = Some(url);
        }
        if let Some(url) = lookup("QUEUE_DATABASE_URL") {
            self.queue.database_url = Some(url);
        }
        if let Some(host) = lookup("AMEX_API_HOST") {
            self.amex.api_host = host;
        }
        if let Credentials::Static {
            client_id,
            client_secret,
            ..
        } = &mut self.amex.credentials
        {
            if let Some(id) = lookup("AMEX_CLIENT_ID") {
                *client_id = id;
            }
            if let Some(secret) = lookup("AMEX_CLIENT_SECRET") {
                *client_secret = secret;
            }
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides, and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides(|key| std::env::var(key).ok());
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.store.busy_timeout_secs == 0 {
        return Err(ConfigError::Invalid("store.busy_timeout_secs must be > 0"));
    }

    if cfg.queue.name.trim().is_empty() {
        return Err(ConfigError::Invalid("queue.name must be non-empty"));
    }
    if cfg.queue.retry_intervals_secs.is_empty() {
        return Err(ConfigError::Invalid("queue.retry_intervals_secs must be non-empty"));
    }
    if cfg.queue.retry_intervals_secs.iter().any(|&s| s > MAX_QUEUE_DELAY_SECS) {
        return Err(ConfigError::Invalid("queue.retry_intervals_secs must each be at most 604800 (7 days)"));
    }
    if cfg.queue.lease_seconds == 0 {
        return Err(ConfigError::Invalid("queue.lease_seconds must be > 0"));
    }
    if cfg.queue.lease_seconds > MAX_QUEUE_DELAY_SECS {
        return Err(ConfigError::Invalid("queue.lease_seconds must be at most 604800 (7 days)"));
    }
    // Each database carries its own migration history.
    if cfg.store_url() == cfg.queue_url() {
        return Err(ConfigError::Invalid("queue.database_url must differ from store.database_url"));
    }

    let host = cfg.amex.api_host.trim();
    if !(host.starts_with("https://") || host.starts_with("http://")) {
        return Err(ConfigError::Invalid("amex.api_host must be an http(s) URL"));
    }
    match &cfg.amex.credentials {
        Credentials::Static {
            client_id,
            client_secret,
            key_path,
            cert_path,
        } => {
            if client_id.trim().is_empty() {
                return Err(ConfigError::Invalid("amex.credentials.client_id must be non-empty"));
            }
            if client_secret.is_empty() {
                return Err(ConfigError::Invalid("amex.credentials.client_secret must be non-empty"));
            }
            if key_path.is_some() != cert_path.is_some() {
                return Err(ConfigError::Invalid(
                    "amex.credentials.key_path and cert_path must be set together",
                ));
            }
        }
        Credentials::SecretDir { path } => {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("amex.credentials.path must be non-empty"));
            }
        }
    }

    Ok(())
}

pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500

store:
  busy_timeout_secs: 30

queue:
  name: "amex"
  max_retries: 3
  retry_intervals_secs: [10, 30, 60]
  lease_seconds: 300

amex:
  api_host: "https://api.dev2s.americanexpress.com"
  require_client_cert: false
  credentials:
    source: static
    client_id: "YOUR_AMEX_CLIENT_ID"
    client_secret: "YOUR_AMEX_CLIENT_SECRET"
    key_path: "./secrets/amex.key"
    cert_path: "./secrets/amex.crt"
"#
}
