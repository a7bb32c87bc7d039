//! Configuration module for the greenhouse collector.
//!
//! Settings come from environment variables with validated bounds and
//! defaults suitable for a single greenhouse node.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::retry::RetryPolicy;

/// Default ingest endpoint for reading batches
const DEFAULT_ENDPOINT_URL: &str = "http://localhost:8000/api/v1/telemetry/batches";

const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 5_000;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
const DEFAULT_BUFFER_CAPACITY: usize = 1_000;
const DEFAULT_MAX_BATCH_SIZE: usize = 200;
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;
const DEFAULT_DEAD_LETTER_PATH: &str = "dead-letter.jsonl";
const DEFAULT_COLLECTOR_ID: &str = "greenhouse-collector";

/// Timer intervals outside this range are rejected
const MIN_INTERVAL_MS: u64 = 10;
const MAX_INTERVAL_MS: u64 = 3_600_000;

const MAX_BUFFER_CAPACITY: usize = 1_000_000;
const MAX_BATCH_SIZE: usize = 10_000;
const MAX_RETRY_ATTEMPTS: u32 = 20;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 300;
const MAX_SHUTDOWN_TIMEOUT_SECS: u64 = 120;

/// Configuration for the greenhouse collector.
///
/// All settings can be configured via `FARM_COLLECTOR_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Time between sensor samples
    pub sampling_interval: Duration,

    /// Time between buffer flushes
    pub flush_interval: Duration,

    /// Readings held before the oldest is evicted
    pub buffer_capacity: usize,

    /// Readings per delivered batch
    pub max_batch_size: usize,

    /// Retries after the first delivery attempt
    pub max_retry_attempts: u32,

    /// Full URL of the ingest endpoint
    pub endpoint_url: String,

    /// HTTP request timeout
    pub request_timeout: Duration,

    /// Upper bound on the final flush during shutdown
    pub shutdown_timeout: Duration,

    /// File receiving undeliverable batches
    pub dead_letter_path: PathBuf,

    /// Identifier attached to every batch
    pub collector_id: String,
}

/// Error type for configuration loading failures
#[derive(Debug, Error)]
#[error("Configuration error for {env_var}: {message}")]
pub struct ConfigError {
    pub env_var: String,
    pub message: String,
}

impl ConfigError {
    fn new(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            env_var: env_var.to_string(),
            message: message.into(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any variable is set to something unparsable
    /// or outside its allowed range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let sampling_interval_ms = parse_bounded(
            "FARM_COLLECTOR_SAMPLING_INTERVAL_MS",
            DEFAULT_SAMPLING_INTERVAL_MS,
            MIN_INTERVAL_MS,
            MAX_INTERVAL_MS,
        )?;
        let flush_interval_ms = parse_bounded(
            "FARM_COLLECTOR_FLUSH_INTERVAL_MS",
            DEFAULT_FLUSH_INTERVAL_MS,
            MIN_INTERVAL_MS,
            MAX_INTERVAL_MS,
        )?;
        let buffer_capacity = parse_bounded(
            "FARM_COLLECTOR_BUFFER_CAPACITY",
            DEFAULT_BUFFER_CAPACITY,
            1,
            MAX_BUFFER_CAPACITY,
        )?;
        let max_batch_size = parse_bounded(
            "FARM_COLLECTOR_MAX_BATCH_SIZE",
            DEFAULT_MAX_BATCH_SIZE,
            1,
            MAX_BATCH_SIZE,
        )?;
        let max_retry_attempts = parse_bounded(
            "FARM_COLLECTOR_MAX_RETRY_ATTEMPTS",
            DEFAULT_MAX_RETRY_ATTEMPTS,
            0,
            MAX_RETRY_ATTEMPTS,
        )?;
        let request_timeout_secs = parse_bounded(
            "FARM_COLLECTOR_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1,
            MAX_REQUEST_TIMEOUT_SECS,
        )?;
        let shutdown_timeout_secs = parse_bounded(
            "FARM_COLLECTOR_SHUTDOWN_TIMEOUT_SECS",
            DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            1,
            MAX_SHUTDOWN_TIMEOUT_SECS,
        )?;

        let endpoint_url = parse_endpoint_url()?;
        let dead_letter_path = PathBuf::from(non_empty(
            "FARM_COLLECTOR_DEAD_LETTER_PATH",
            DEFAULT_DEAD_LETTER_PATH,
        )?);
        let collector_id = non_empty("FARM_COLLECTOR_ID", DEFAULT_COLLECTOR_ID)?;

        if flush_interval_ms < sampling_interval_ms {
            warn!(
                sampling_interval_ms,
                flush_interval_ms,
                "Flush interval is shorter than sampling interval; batches will hold few readings"
            );
        }

        Ok(Self {
            sampling_interval: Duration::from_millis(sampling_interval_ms),
            flush_interval: Duration::from_millis(flush_interval_ms),
            buffer_capacity,
            max_batch_size,
            max_retry_attempts,
            endpoint_url,
            request_timeout: Duration::from_secs(request_timeout_secs),
            shutdown_timeout: Duration::from_secs(shutdown_timeout_secs),
            dead_letter_path,
            collector_id,
        })
    }

    /// Retry policy with the configured budget and default backoff.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retry_attempts)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_millis(DEFAULT_SAMPLING_INTERVAL_MS),
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            dead_letter_path: PathBuf::from(DEFAULT_DEAD_LETTER_PATH),
            collector_id: DEFAULT_COLLECTOR_ID.to_string(),
        }
    }
}

/// Parse a numeric variable, enforcing `min..=max`.
fn parse_bounded<T>(env_var: &str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Display + Copy,
{
    let raw = match env::var(env_var) {
        Ok(raw) => raw,
        Err(_) => return Ok(default),
    };

    let value: T = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::new(env_var, format!("'{}' is not a valid number", raw)))?;

    if value < min {
        return Err(ConfigError::new(
            env_var,
            format!("{} is below minimum ({})", value, min),
        ));
    }
    if value > max {
        return Err(ConfigError::new(
            env_var,
            format!("{} exceeds maximum ({})", value, max),
        ));
    }

    Ok(value)
}

fn parse_endpoint_url() -> Result<String, ConfigError> {
    let env_var = "FARM_COLLECTOR_ENDPOINT_URL";
    let url = non_empty(env_var, DEFAULT_ENDPOINT_URL)?;
    let url = url.trim_end_matches('/').to_string();

    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::new(
            env_var,
            format!("'{}' must start with http:// or https://", url),
        ));
    }

    Ok(url)
}

fn non_empty(env_var: &str, default: &str) -> Result<String, ConfigError> {
    match env::var(env_var) {
        Ok(value) if value.trim().is_empty() => {
            Err(ConfigError::new(env_var, "must not be empty"))
        }
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => Ok(default.to_string()),
    }
}
