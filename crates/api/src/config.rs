//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use event_stream::{ConsumerGroup, PostgresStreamOptions, StartPosition};
use saga::{ConsumerConfig, RetryPolicy};

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON log lines (default: human-readable)
/// - `DATABASE_URL`: PostgreSQL URL; unset runs fully in memory
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `CONSUMER_GROUP`: consumer group name (default: `"saga-coordinator"`)
/// - `STREAM_PARTITIONS`: partitions and worker count (default: `4`)
/// - `STREAM_START`: `latest` or `earliest` (default: `latest`)
/// - `STREAM_POLL_INTERVAL_MS`: idle poll interval (default: `200`)
/// - `STREAM_REDELIVERY_DELAY_MS`: pause before an uncommitted event is
///   handed out again (default: `1000`)
/// - `TX_MAX_ATTEMPTS`: attempts per step transaction (default: `8`)
/// - `TX_DEADLINE_MS`: retry deadline per step transaction (default: `30000`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub consumer_group: String,
    pub stream_partitions: u32,
    pub stream_start: StartPosition,
    pub stream_poll_interval: Duration,
    pub stream_redelivery_delay: Duration,
    pub tx_max_attempts: u32,
    pub tx_deadline: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    ///
    /// Unparseable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            database_max_connections: parse_var(&lookup, "DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            consumer_group: lookup("CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            stream_partitions: parse_var(&lookup, "STREAM_PARTITIONS")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.stream_partitions),
            stream_start: parse_var(&lookup, "STREAM_START").unwrap_or(defaults.stream_start),
            stream_poll_interval: parse_var(&lookup, "STREAM_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.stream_poll_interval),
            stream_redelivery_delay: parse_var(&lookup, "STREAM_REDELIVERY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.stream_redelivery_delay),
            tx_max_attempts: parse_var(&lookup, "TX_MAX_ATTEMPTS")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.tx_max_attempts),
            tx_deadline: parse_var(&lookup, "TX_DEADLINE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.tx_deadline),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.tx_max_attempts,
            deadline: self.tx_deadline,
            ..RetryPolicy::default()
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            group: ConsumerGroup::new(self.consumer_group.clone()).with_start(self.stream_start),
            ..ConsumerConfig::default()
        }
    }

    pub fn stream_options(&self) -> PostgresStreamOptions {
        PostgresStreamOptions {
            partitions: self.stream_partitions,
            poll_interval: self.stream_poll_interval,
            redelivery_delay: self.stream_redelivery_delay,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            database_max_connections: 10,
            consumer_group: "saga-coordinator".to_string(),
            stream_partitions: 4,
            stream_start: StartPosition::Latest,
            stream_poll_interval: Duration::from_millis(200),
            stream_redelivery_delay: Duration::from_secs(1),
            tx_max_attempts: 8,
            tx_deadline: Duration::from_secs(30),
        }
    }
}
