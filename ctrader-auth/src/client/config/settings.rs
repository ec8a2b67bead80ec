use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// JSON file holding `client_id`, `client_secret` and optionally `token_endpoint`
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Tokens expiring within this many seconds are refreshed before use
    #[serde(default = "default_token_leeway_secs")]
    pub token_leeway_secs: i64,
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("fxsession"))
        .unwrap_or_default()
}

fn default_credentials_file() -> PathBuf {
    config_dir().join("credentials.json")
}

fn default_token_file() -> PathBuf {
    config_dir().join("token.json")
}

fn default_http_timeout_secs() -> u64 {
    15
}

fn default_token_leeway_secs() -> i64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
            token_file: default_token_file(),
            http_timeout_secs: default_http_timeout_secs(),
            token_leeway_secs: default_token_leeway_secs(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("FXSESSION_AUTH_CONFIG").unwrap_or_else(|_| "auth.toml".to_string());

        Self::build(File::with_name(&config_path).required(false))
    }

    /// Load from an explicit file (format picked from its extension) plus the environment.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::build(File::from(path).required(false))
    }

    fn build<S>(file: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("CTRADER_AUTH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.credentials_file.as_os_str().is_empty() {
            return Err("auth.credentials_file is required".to_string());
        }
        if self.token_file.as_os_str().is_empty() {
            return Err("auth.token_file is required".to_string());
        }
        if self.http_timeout_secs == 0 {
            return Err("auth.http_timeout_secs must be greater than zero".to_string());
        }
        if self.token_leeway_secs < 0 {
            return Err("auth.token_leeway_secs must not be negative".to_string());
        }
        Ok(())
    }
}
