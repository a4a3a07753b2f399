//! Producer-supplied configuration.
//!
//! A `clap::Parser` derive lets every field double as a CLI flag or an
//! environment variable (the `env` feature), which keeps this crate usable
//! both from a host app's own config loader and standalone. Config
//! *loading* (env parsing, DTO validation against an external source) is a
//! host-application concern; this crate is the thin settings surface the
//! core reads from, not a loader.

use std::time::Duration;

use clap::{
    Args,
    Parser,
};
use log_shipper_errors::LogShipperError;

/// Driver pool/timeout overrides.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    #[arg(long, env = "LOG_SHIPPER_MAX_POOL_SIZE", default_value_t = 10)]
    pub max_pool_size: u32,

    #[arg(long, env = "LOG_SHIPPER_MIN_POOL_SIZE", default_value_t = 2)]
    pub min_pool_size: u32,

    #[arg(long, env = "LOG_SHIPPER_IDLE_TIMEOUT_SECS", default_value_t = 30)]
    pub idle_timeout_secs: u64,

    #[arg(long, env = "LOG_SHIPPER_SERVER_SELECTION_TIMEOUT_SECS", default_value_t = 5)]
    pub server_selection_timeout_secs: u64,

    #[arg(long, env = "LOG_SHIPPER_SOCKET_TIMEOUT_SECS", default_value_t = 45)]
    pub socket_timeout_secs: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            min_pool_size: 2,
            idle_timeout_secs: 30,
            server_selection_timeout_secs: 5,
            socket_timeout_secs: 45,
        }
    }
}

impl ConnectionOptions {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_secs(self.server_selection_timeout_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }
}

/// Full producer-supplied configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Batched MongoDB log shipper configuration")]
pub struct Config {
    /// Connection string; the database name is derived from its path
    /// segment (fallback `logs`).
    #[arg(long, env = "LOG_SHIPPER_URI")]
    pub uri: String,

    /// Used when a log entry omits `collection`.
    #[arg(long, env = "LOG_SHIPPER_DEFAULT_COLLECTION", default_value = "logs")]
    pub default_collection: String,

    /// Entries per collection batch before a size-triggered flush.
    #[arg(long, env = "LOG_SHIPPER_BATCH_SIZE", default_value_t = 500)]
    pub batch_size: usize,

    /// Timer period and staleness threshold, in milliseconds.
    #[arg(long, env = "LOG_SHIPPER_FLUSH_INTERVAL_MS", default_value_t = 5000)]
    pub flush_interval_ms: u64,

    /// Global memory cap for staged bytes, in MiB.
    #[arg(long, env = "LOG_SHIPPER_MAX_MEMORY_USAGE_MB", default_value_t = 100)]
    pub max_memory_usage_mb: u64,

    /// Base delay for connection backoff, in milliseconds.
    #[arg(long, env = "LOG_SHIPPER_RETRY_DELAY_MS", default_value_t = 1000)]
    pub retry_delay_ms: u64,

    /// Upper bound for the shutdown flush, in milliseconds.
    #[arg(long, env = "LOG_SHIPPER_GRACEFUL_SHUTDOWN_TIMEOUT_MS", default_value_t = 30_000)]
    pub graceful_shutdown_timeout_ms: u64,

    /// Consecutive connect failures before the circuit breaker opens.
    /// Exposed here so it's tunable through the same surface as everything
    /// else rather than hardcoded.
    #[arg(long, env = "LOG_SHIPPER_CIRCUIT_FAILURE_THRESHOLD", default_value_t = 5)]
    pub circuit_failure_threshold: u32,

    /// How long the breaker stays open before a half-open trial, in
    /// milliseconds.
    #[arg(long, env = "LOG_SHIPPER_CIRCUIT_OPEN_DURATION_MS", default_value_t = 30_000)]
    pub circuit_open_duration_ms: u64,

    #[command(flatten)]
    pub connection_options: ConnectionOptions,
}

impl Config {
    pub fn max_memory_usage_bytes(&self) -> u64 {
        self.max_memory_usage_mb * bytesize::MIB
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    pub fn circuit_open_duration(&self) -> Duration {
        Duration::from_millis(self.circuit_open_duration_ms)
    }

    /// Validates numeric ranges the derive can't express: a `batch_size` of
    /// 0 would never trigger a size-flush, and a collection name resolving
    /// empty would violate the invariant that every entry routes somewhere.
    pub fn validate(&self) -> Result<(), LogShipperError> {
        if self.uri.trim().is_empty() {
            return Err(LogShipperError::Configuration("uri must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(LogShipperError::Configuration(
                "batch_size must be at least 1".into(),
            ));
        }
        if self.default_collection.trim().is_empty() {
            return Err(LogShipperError::Configuration(
                "default_collection must not be empty".into(),
            ));
        }
        if self.max_memory_usage_mb == 0 {
            return Err(LogShipperError::Configuration(
                "max_memory_usage_mb must be at least 1".into(),
            ));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(LogShipperError::Configuration(
                "circuit_failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            uri: "mongodb://localhost:27017/logs".into(),
            default_collection: "logs".into(),
            batch_size: 500,
            flush_interval_ms: 5000,
            max_memory_usage_mb: 100,
            retry_delay_ms: 1000,
            graceful_shutdown_timeout_ms: 30_000,
            circuit_failure_threshold: 5,
            circuit_open_duration_ms: 30_000,
            connection_options: ConnectionOptions::default(),
        }
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut cfg = base_config();
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_uri() {
        let mut cfg = base_config();
        cfg.uri = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_defaults() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn converts_mib_to_bytes() {
        let cfg = base_config();
        assert_eq!(cfg.max_memory_usage_bytes(), 100 * bytesize::MIB);
    }
}
