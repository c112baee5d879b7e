// src/config.rs

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::retry::{RetryConfig, RetryPolicies};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "SEGSIZE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "segsize.toml";

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 6.1; Win64; x64; rv:47.0) Gecko/20100101 Firefox/47.0";

/// DASH formats in order of preference.
const DEFAULT_FORMAT_PRIORITY: [&str; 20] = [
    "dash-full",
    "dash",
    "dash-avc",
    "dashhbbtv",
    "dash-hbbtv",
    "dash-hbbtv-avc",
    "dash-hb-avc",
    "dash-lb-full",
    "dash-lb",
    "dash-lb-avc",
    "dash-hbbtv-avc-51",
    "dash-hb-avc-51",
    "dash-avc-51",
    "dash-hevc",
    "dash-hbbtv-hevc",
    "dash-hb-hevc",
    "dash-lb-hevc",
    "dash-hevc-51",
    "dash-hbbtv-hevc-51",
    "dash-hb-hevc-51",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub database_path: PathBuf,
    /// Wall-clock limit of one segment-size pass.
    pub run_horizon_secs: u64,
    /// Maximum concurrent size probes per representation.
    pub concurrency_limit: usize,
    pub probe_timeout_secs: u64,
    /// Bound on every other request (video JSON, manifest, catalog).
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub format_priority: Vec<String>,
    pub excluded_codecs: Vec<String>,
    /// Pull the catalog before probing.
    pub refresh_catalog: bool,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "https://api.svt.se".to_string(),
            database_path: PathBuf::from("segsize.db"),
            run_horizon_secs: 5 * 60 * 60,
            concurrency_limit: 100,
            probe_timeout_secs: 10,
            request_timeout_secs: 300,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            format_priority: DEFAULT_FORMAT_PRIORITY.iter().map(|f| f.to_string()).collect(),
            excluded_codecs: vec!["hvc".to_string(), "ac-3".to_string()],
            refresh_catalog: true,
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Loads the file named by `SEGSIZE_CONFIG`, or `segsize.toml` if that
    /// variable is unset. Only the implicit default path may be missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => match Self::load(Path::new(DEFAULT_CONFIG_PATH)) {
                Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                    Ok(Self::default())
                }
                other => other,
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Invalid(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 || self.probe_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request and probe timeouts must be at least one second".to_string(),
            ));
        }
        if self.format_priority.is_empty() {
            return Err(ConfigError::Invalid(
                "format_priority must name at least one format".to_string(),
            ));
        }
        Ok(())
    }

    pub fn run_horizon(&self) -> Duration {
        Duration::from_secs(self.run_horizon_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policies(&self) -> RetryPolicies {
        RetryPolicies::from(&self.retry)
    }

    pub fn catalog_retry_policies(&self) -> RetryPolicies {
        RetryPolicies::catalog(&self.retry)
    }
}
