use std::path::Path;
use serde::Deserialize;
use url::Url;
use crate::upload::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, DEFAULT_EVENT_CAPACITY, DEFAULT_REQUEST_TIMEOUT, Result, UploadConfig,
    UploadError,
};

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// 后端地址，例如 `http://127.0.0.1:5000/api`
    pub server_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub attachment_token: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|err| UploadError::ConfigError(format!("Can't read {}: {}", path.display(), err)))?;

        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(config_str)
            .map_err(|err| UploadError::ConfigError(err.to_string()))?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        Url::parse(&self.server_url)
            .map_err(|err| UploadError::ConfigError(format!("Invalid server_url {}: {}", self.server_url, err)))?;

        if self.chunk_size == 0 {
            return Err(UploadError::ConfigError("chunk_size must be greater than 0".to_string()));
        }
        if self.concurrency == 0 {
            return Err(UploadError::ConfigError("concurrency must be greater than 0".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(UploadError::ConfigError("request_timeout_secs must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            chunk_size: self.chunk_size,
            concurrency: self.concurrency,
            event_capacity: self.event_capacity,
        }
    }
}
