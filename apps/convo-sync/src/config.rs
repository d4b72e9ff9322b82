use crate::store::{DEFAULT_PAGE_SIZE, DEFAULT_TOPIC_PREFIX, StoreConfig};
use crate::transport::{Backoff, ConnectionConfig};
use crate::viewport::{DEFAULT_NEAR_BOTTOM_THRESHOLD, ViewportAnchor};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const API_URL_ENV: &str = "CONVO_API_URL";
pub const BROKER_URL_ENV: &str = "CONVO_BROKER_URL";
pub const TOKEN_ENV: &str = "CONVO_TOKEN";
pub const PAGE_SIZE_ENV: &str = "CONVO_PAGE_SIZE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Sync client configuration.
///
/// Loaded from an optional TOML file; every section and key has a default, and
/// the `CONVO_*` environment variables take precedence over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub api: ApiSection,
    pub broker: BrokerSection,
    pub store: StoreSection,
    pub viewport: ViewportSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiSection {
    pub base_url: String,
    /// Bearer token for REST calls, also presented to the broker on CONNECT.
    pub token: Option<String>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSection {
    pub url: String,
    pub host: String,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            host: "localhost".to_string(),
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            reconnect_initial_ms: 250,
            reconnect_max_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub page_size: u32,
    pub topic_prefix: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViewportSection {
    pub near_bottom_threshold: u32,
}

impl Default for ViewportSection {
    fn default() -> Self {
        Self {
            near_bottom_threshold: DEFAULT_NEAR_BOTTOM_THRESHOLD,
        }
    }
}

impl SyncConfig {
    /// File (if any), then environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| env::var(var).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(API_URL_ENV) {
            self.api.base_url = url;
        }
        if let Some(url) = lookup(BROKER_URL_ENV) {
            self.broker.url = url;
        }
        if let Some(token) = lookup(TOKEN_ENV) {
            self.api.token = Some(token).filter(|token| !token.is_empty());
        }
        if let Some(value) = lookup(PAGE_SIZE_ENV) {
            self.store.page_size = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: PAGE_SIZE_ENV,
                value,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("api.base_url is empty".into()));
        }
        if self.broker.url.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.url is empty".into()));
        }
        if self.store.page_size == 0 {
            return Err(ConfigError::Invalid("store.page_size must be positive".into()));
        }
        let broker = &self.broker;
        if broker.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "broker.heartbeat_timeout_ms must be positive".into(),
            ));
        }
        if broker.heartbeat_timeout_ms < broker.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "broker.heartbeat_timeout_ms ({}) is shorter than broker.heartbeat_interval_ms ({})",
                broker.heartbeat_timeout_ms, broker.heartbeat_interval_ms
            )));
        }
        if broker.reconnect_initial_ms == 0 || broker.reconnect_initial_ms > broker.reconnect_max_ms {
            return Err(ConfigError::Invalid(
                "broker.reconnect_initial_ms must be positive and at most reconnect_max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.broker.host.clone(),
            token: self.api.token.clone(),
            heartbeat_interval: Duration::from_millis(self.broker.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.broker.heartbeat_timeout_ms),
            backoff: Backoff {
                initial: Duration::from_millis(self.broker.reconnect_initial_ms),
                max: Duration::from_millis(self.broker.reconnect_max_ms),
            },
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            page_size: self.store.page_size,
            topic_prefix: self.store.topic_prefix.clone(),
        }
    }

    pub fn viewport(&self) -> ViewportAnchor {
        ViewportAnchor::new(self.viewport.near_bottom_threshold)
    }
}
