use std::{fs, path::Path, time::Duration};

use anyhow::{Context, bail};
use libruntime::cri::{
    CriClientConfig,
    client::{DEFAULT_ENDPOINT, MIN_MAX_MESSAGE_SIZE},
};
use serde::{Deserialize, Serialize};

use crate::daemon::status::pleg::{DEFAULT_CHANNEL_CAPACITY, PlegConfig};

/// Daemon configuration, read from an optional YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    // unix:///path, /path or http(s)://host:port
    pub runtime_endpoint: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    // raised to at least 16 MiB
    pub max_message_size: usize,
    pub relist_period_ms: u64,
    pub event_channel_capacity: usize,
    pub health_check_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime_endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout_ms: 5000,
            connect_timeout_ms: 5000,
            max_message_size: MIN_MAX_MESSAGE_SIZE,
            relist_period_ms: 1000,
            event_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            health_check_interval_ms: 30_000,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runtime_endpoint.trim().is_empty() {
            bail!("runtime_endpoint must not be empty");
        }
        if self.relist_period_ms == 0 {
            bail!("relist_period_ms must be greater than zero");
        }
        if self.event_channel_capacity == 0 {
            bail!("event_channel_capacity must be greater than zero");
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            bail!("request_timeout_ms and connect_timeout_ms must be greater than zero");
        }
        if self.health_check_interval_ms == 0 {
            bail!("health_check_interval_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn cri_client_config(&self) -> CriClientConfig {
        CriClientConfig {
            endpoint: self.runtime_endpoint.clone(),
            timeout: Duration::from_millis(self.request_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_message_size: self.max_message_size.max(MIN_MAX_MESSAGE_SIZE),
        }
    }

    pub fn pleg_config(&self) -> PlegConfig {
        PlegConfig {
            relist_period: Duration::from_millis(self.relist_period_ms),
            channel_capacity: self.event_channel_capacity,
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    cfg.validate()
        .with_context(|| format!("Invalid config in {}", path.display()))?;
    Ok(cfg)
}

/// Loads `path` if given, otherwise starts from defaults, then applies the
/// endpoint override from the command line or environment.
pub fn resolve_config(
    path: Option<&Path>,
    endpoint_override: Option<&str>,
) -> anyhow::Result<Config> {
    let mut cfg = match path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    if let Some(endpoint) = endpoint_override {
        cfg.runtime_endpoint = endpoint.to_string();
    }
    cfg.validate()?;
    Ok(cfg)
}
