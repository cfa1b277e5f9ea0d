//! Client configuration
//!
//! Typed configuration consumed by the bus client: broker target, client
//! name, optional credentials, TLS material, and reconnect buffering.
//! Loadable from a TOML file with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default reconnect buffer capacity applied when the configured size is zero.
pub const DEFAULT_RECONNECT_BUF_SIZE: usize = 5 * 1024 * 1024;

/// Bus client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    /// Broker URL with scheme and port, e.g. `mqtt://localhost:1883`.
    pub url: String,
    /// Client name reported to the broker.
    pub name: String,
    /// Optional username.
    #[serde(default)]
    pub user: Option<String>,
    /// Optional password.
    #[serde(default)]
    pub pass: Option<String>,
    /// TLS settings.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Bytes of outbound messages buffered while reconnecting. Zero selects
    /// the 5 MiB default; a negative value disables buffering entirely, so
    /// sends attempted while disconnected fail immediately.
    #[serde(default)]
    pub reconnect_buf_size: i64,
}

/// TLS section of the client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Client certificate path (mutual TLS).
    #[serde(default)]
    pub cert: Option<String>,
    /// Client key path (mutual TLS).
    #[serde(default)]
    pub key: Option<String>,
    /// Root CA certificate path.
    #[serde(default)]
    pub ca: Option<String>,
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BusConfig {
    /// Create a configuration with the given target and client name.
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        BusConfig {
            url: url.into(),
            name: name.into(),
            user: None,
            pass: None,
            tls: TlsConfig::default(),
            reconnect_buf_size: 0,
        }
    }

    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: BusConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `BUS_URL` / `BUS_USER` / `BUS_PASS` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BUS_URL") {
            self.url = url;
        }
        if let Ok(user) = std::env::var("BUS_USER") {
            self.user = Some(user);
        }
        if let Ok(pass) = std::env::var("BUS_PASS") {
            self.pass = Some(pass);
        }
    }

    /// Validate required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidConfig("url must not be empty".to_string()));
        }
        if self.name.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "name must not be empty".to_string(),
            ));
        }
        if self.tls.enabled && self.tls.ca.is_none() {
            return Err(ConfigError::InvalidConfig(
                "tls.ca is required when tls is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective reconnect buffer capacity in bytes per the configured size:
    /// zero selects the default, negative disables buffering.
    pub fn effective_reconnect_buf_size(&self) -> usize {
        crate::bus::connection::reconnect_buffer_capacity(self.reconnect_buf_size)
    }
}
