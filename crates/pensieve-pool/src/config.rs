//! Pool configuration loaded from environment variables.

use std::time::Duration;

use crate::{Error, Result};

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Deadline for a relay transport connect.
    pub connect_timeout: Duration,

    /// Shared per-leg deadline for fan-out queries.
    pub query_timeout: Duration,

    /// Per-relay deadline for publishing an event.
    pub publish_timeout: Duration,

    /// How often the health monitor probes every pooled relay.
    pub health_check_interval: Duration,

    /// Deadline for a single health probe (connect plus round trip).
    pub probe_timeout: Duration,

    /// Default TTL for cached NIP-11 documents.
    pub info_cache_ttl: Duration,

    /// Number of samples kept in each relay's latency/event-rate history.
    pub history_capacity: usize,

    /// Re-attempt disconnected relays once per monitoring interval.
    pub auto_reconnect: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            info_cache_ttl: Duration::from_secs(300), // 5 minutes
            history_capacity: 60,
            auto_reconnect: false,
        }
    }
}

impl PoolConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional and falls back to [`PoolConfig::default`]:
    /// - `POOL_CONNECT_TIMEOUT_SECS`
    /// - `POOL_QUERY_TIMEOUT_SECS`
    /// - `POOL_PUBLISH_TIMEOUT_SECS`
    /// - `POOL_HEALTH_INTERVAL_SECS`
    /// - `POOL_PROBE_TIMEOUT_SECS`
    /// - `POOL_INFO_TTL_SECS`
    /// - `POOL_HISTORY_CAPACITY`
    /// - `POOL_AUTO_RECONNECT` (`true`/`false`/`1`/`0`)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            connect_timeout: env_secs("POOL_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            query_timeout: env_secs("POOL_QUERY_TIMEOUT_SECS", defaults.query_timeout)?,
            publish_timeout: env_secs("POOL_PUBLISH_TIMEOUT_SECS", defaults.publish_timeout)?,
            health_check_interval: env_secs(
                "POOL_HEALTH_INTERVAL_SECS",
                defaults.health_check_interval,
            )?,
            probe_timeout: env_secs("POOL_PROBE_TIMEOUT_SECS", defaults.probe_timeout)?,
            info_cache_ttl: env_secs("POOL_INFO_TTL_SECS", defaults.info_cache_ttl)?,
            history_capacity: env_parse("POOL_HISTORY_CAPACITY", defaults.history_capacity)?,
            auto_reconnect: env_bool("POOL_AUTO_RECONNECT", defaults.auto_reconnect)?,
        };

        tracing::info!(
            connect_timeout = ?config.connect_timeout,
            query_timeout = ?config.query_timeout,
            health_check_interval = ?config.health_check_interval,
            info_cache_ttl = ?config.info_cache_ttl,
            auto_reconnect = config.auto_reconnect,
            "pool configuration loaded"
        );

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key}: cannot parse '{raw}'"))),
        _ => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(Error::Config(format!("{key}: expected a boolean, got '{raw}'"))),
        },
        Err(_) => Ok(default),
    }
}
