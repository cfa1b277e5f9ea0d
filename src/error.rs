//! Error types for bus operations
//!
//! Connect-time and capability errors are fatal to startup; publish/request
//! errors are retryable and propagate once retries exhaust; teardown errors
//! (unsubscribe, drain, flush-on-close) are returned so callers can log them,
//! and must never abort shutdown.

use crate::bus::ConnectionState;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("broker does not support message headers")]
    HeadersUnsupported,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error("drain timed out after {0:?}")]
    DrainTimedOut(Duration),

    #[error("subscription closed")]
    SubscriptionClosed,

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;
