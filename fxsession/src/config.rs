use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime knobs for the session core.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retries after the first attempt times out
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: f64,
    #[serde(default = "default_history_count")]
    pub history_default_count: u32,
    #[serde(default = "default_pnl_min_interval_secs")]
    pub funds_pnl_min_interval_secs: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("fxsession"))
        .unwrap_or_default()
        .join("logs")
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_retry_max_attempts() -> u32 {
    2
}

fn default_retry_backoff_secs() -> f64 {
    2.0
}

fn default_history_count() -> u32 {
    1000
}

fn default_pnl_min_interval_secs() -> f64 {
    2.0
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            request_timeout_secs: default_request_timeout_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            history_default_count: default_history_count(),
            funds_pnl_min_interval_secs: default_pnl_min_interval_secs(),
        }
    }
}

impl RuntimeSettings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("FXSESSION_CONFIG").unwrap_or_else(|_| "fxsession.toml".to_string());

        Self::build(File::with_name(&config_path).required(false))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::build(File::from(path).required(false))
    }

    fn build<S>(file: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("CTRADER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pnl_min_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.funds_pnl_min_interval_secs).unwrap_or_default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            backoff: Duration::try_from_secs_f64(self.retry_backoff_secs).unwrap_or_default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than zero".to_string());
        }
        if self.history_default_count == 0 {
            return Err("history_default_count must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Bounded retry schedule for timed-out requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before a retry is sent; zero resends immediately
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            backoff: Duration::from_secs(2),
        }
    }
}
