use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

/// How often the pool sweeps its tunnels for liveness.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Longer than the default TCP retry backoff (127 seconds). Only intended to
/// catch otherwise uncaught hangs in the transport layer.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(150);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    IO(#[from] std::io::Error),
    #[error("{0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("unsupported health check url {0}, expected http://host[:port][/path]")]
    UnsupportedUrl(String),
}

#[derive(Serialize, Deserialize, Validate, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct TunnelConfig {
    #[validate(length(min = 1))]
    pub user: String,
    #[validate(length(min = 1))]
    pub key_file: String,
    #[validate(url)]
    pub health_check_url: String,
    pub health_check_interval_secs: Option<u64>,
    pub dial_timeout_secs: Option<u64>,
}

impl TunnelConfig {
    pub fn load(path: &str) -> Result<TunnelConfig, ConfigError> {
        let path = shellexpand::tilde(path).to_string();
        let file = std::fs::File::open(Path::new(&path))?;
        let config: TunnelConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL)
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DIAL_TIMEOUT)
    }

    pub fn health_check_target(&self) -> Result<HealthCheckTarget, ConfigError> {
        parse_health_check_url(&self.health_check_url)
    }
}

/// The parsed health check endpoint. The probe is plain HTTP carried inside
/// the encrypted tunnel, so only http:// urls are accepted.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthCheckTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

static HEALTH_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^http://([^/:\s]+)(?::(\d+))?(/\S*)?$").unwrap());

pub fn parse_health_check_url(url: &str) -> Result<HealthCheckTarget, ConfigError> {
    let caps = HEALTH_URL_RE
        .captures(url)
        .ok_or_else(|| ConfigError::UnsupportedUrl(url.to_string()))?;

    let host = caps[1].to_string();
    let port = match caps.get(2) {
        Some(p) => p
            .as_str()
            .parse::<u16>()
            .map_err(|_| ConfigError::UnsupportedUrl(url.to_string()))?,
        None => 80,
    };
    let path = caps
        .get(3)
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    Ok(HealthCheckTarget { host, port, path })
}
