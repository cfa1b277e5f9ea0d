//! Structured logging setup
//!
//! Logging rides the tracing ecosystem. [`init`] installs the global
//! subscriber from a typed [`LogConfig`]; [`init_from_env`] reads
//! `LOG_LEVEL` and `LOG_FORMAT` instead. `RUST_LOG`, when set, overrides
//! the filter entirely.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// Minimum level: error, warn, info, debug, trace.
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Machine-readable JSON, one object per line.
    #[default]
    Json,
    /// Human-readable multi-line output for development.
    Pretty,
    /// Single-line terminal output.
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Install the global tracing subscriber. A no-op when a subscriber is
/// already installed, so repeated calls (and tests) are safe.
pub fn init(config: &LogConfig) {
    let filter = std::env::var("RUST_LOG")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| {
            // Quiet the transport and runtime internals by default.
            EnvFilter::new(format!("{},rumqttc=warn,tokio=warn", config.level))
        });

    let registry = tracing_subscriber::registry().with(filter);
    let _ = match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(false))
            .try_init(),
    };
}

/// Install the global subscriber from `LOG_LEVEL` and `LOG_FORMAT`.
/// Unknown values fall back to `info` / JSON.
pub fn init_from_env() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| default_level());
    let format = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or_default();
    init(&LogConfig { level, format });
}
