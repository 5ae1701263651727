//! Configuration management for the reminder scheduler.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Only `DATABASE_URL` is required. Unparseable numbers fall back to their
//! defaults.

use relay_runtime::{PublisherConfig, WorkerConfig};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable is set to a value that cannot be used.
    #[error("Invalid value for {name}: {value}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Offending value
        value: String,
    },
}

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `PostgreSQL` connection URL
    pub database_url: String,
    /// Maximum number of connections in the pool
    pub database_max_connections: u32,
    /// Broker addresses (comma-separated); `None` disables the bus
    pub kafka_brokers: Option<String>,
    /// Consumer group for reminder requests
    pub kafka_group_id: String,
    /// Topic carrying reminder requests
    pub kafka_consume_topic: String,
    /// Outbox poll interval
    pub outbox_poll_interval: Duration,
    /// Outbox rows per batch
    pub outbox_batch_size: usize,
    /// Job poll interval
    pub scheduler_poll_interval: Duration,
    /// Jobs per batch
    pub scheduler_batch_size: usize,
    /// Delay before a failed job is retried
    pub scheduler_backoff: Duration,
    /// Attempts before a job is dead-lettered
    pub scheduler_max_attempts: u32,
    /// Prometheus listener; `None` disables the exporter
    pub metrics_addr: Option<SocketAddr>,
    /// Listener of the `/healthz` and `/readyz` routes
    pub http_addr: SocketAddr,
    /// How long loops get to stop after the shutdown signal
    pub shutdown_timeout: Duration,
    /// Emit logs as JSON
    pub json_logs: bool,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// See [`Config::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `DATABASE_URL` is not set and
    /// [`ConfigError::Invalid`] if `METRICS_ADDR` is not a socket address or
    /// `PORT` is not a port number.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |name: &str, default: u64| {
            get(name)
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default)
        };

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let metrics_addr = get("METRICS_ADDR")
            .map(|value| {
                value.parse::<SocketAddr>().map_err(|_| ConfigError::Invalid {
                    name: "METRICS_ADDR",
                    value,
                })
            })
            .transpose()?;

        let port = match get("PORT") {
            Some(value) => value
                .parse::<u16>()
                .ok()
                .filter(|port| *port > 0)
                .ok_or(ConfigError::Invalid { name: "PORT", value })?,
            None => 8087,
        };

        Ok(Self {
            database_url,
            database_max_connections: u32::try_from(number("DATABASE_MAX_CONNECTIONS", 10))
                .unwrap_or(10),
            kafka_brokers: get("KAFKA_BROKERS"),
            kafka_group_id: get("KAFKA_GROUP_ID").unwrap_or_else(|| "scheduler-service".to_string()),
            kafka_consume_topic: get("KAFKA_CONSUME_TOPIC")
                .unwrap_or_else(|| crate::reminders::REMINDER_REQUESTED.to_string()),
            outbox_poll_interval: Duration::from_millis(number("OUTBOX_POLL_MS", 2000)),
            outbox_batch_size: usize::try_from(number("OUTBOX_BATCH_SIZE", 50)).unwrap_or(50),
            scheduler_poll_interval: Duration::from_millis(number("SCHEDULER_POLL_MS", 2000)),
            scheduler_batch_size: usize::try_from(number("SCHEDULER_BATCH_SIZE", 50)).unwrap_or(50),
            scheduler_backoff: Duration::from_secs(number("SCHEDULER_BACKOFF_SECONDS", 60)),
            scheduler_max_attempts: u32::try_from(number("SCHEDULER_MAX_ATTEMPTS", 5)).unwrap_or(5),
            metrics_addr,
            http_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            shutdown_timeout: Duration::from_secs(number("SHUTDOWN_TIMEOUT_SECONDS", 10)),
            json_logs: get("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }

    /// Outbox publisher settings.
    #[must_use]
    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig::default()
            .with_poll_interval(self.outbox_poll_interval)
            .with_batch_size(self.outbox_batch_size)
    }

    /// Job worker settings.
    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(self.scheduler_poll_interval)
            .with_batch_size(self.scheduler_batch_size)
    }
}
