//! Gateway configuration from environment variables.

use crate::change_source::SourceSettings;
use crate::error::{GatewayError, Result};
use cart_store::DEFAULT_KEY_PREFIX;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Who owns change sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceModel {
    /// One process-wide change source; each change fans out to every active scope.
    Global,
    /// Every connection owns its change source, stopped on disconnect.
    PerConnection,
}

impl ResourceModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceModel::Global => "global",
            ResourceModel::PerConnection => "per_connection",
        }
    }
}

impl FromStr for ResourceModel {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(ResourceModel::Global),
            "per_connection" | "per-connection" | "connection" => Ok(ResourceModel::PerConnection),
            other => Err(GatewayError::Config(format!(
                "RESOURCE_MODEL must be 'global' or 'per_connection', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ResourceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which cart store backs the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(GatewayError::Config(format!(
                "STORE_BACKEND must be 'redis' or 'memory', got '{}'",
                other
            ))),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    /// 0 disables the Prometheus exporter.
    pub metrics_port: u16,
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub key_prefix: String,
    pub resource_model: ResourceModel,
    pub poll_interval: Duration,
    pub feed_setup_timeout: Duration,
    pub client_buffer_size: usize,
    pub ping_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 3000,
            metrics_port: 9093,
            store_backend: StoreBackend::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            resource_model: ResourceModel::Global,
            poll_interval: Duration::from_secs(10),
            feed_setup_timeout: Duration::from_secs(5),
            client_buffer_size: 64,
            ping_interval: Duration::from_secs(30),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| GatewayError::Config(format!("{} is invalid ('{}'): {}", key, raw, e))),
        _ => Ok(default),
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    let secs: u64 = parse_var(lookup, key, default.as_secs())?;
    if secs == 0 {
        return Err(GatewayError::Config(format!("{} must be at least 1", key)));
    }
    Ok(Duration::from_secs(secs))
}

impl GatewayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let http_port = match lookup("HTTP_PORT") {
            Some(_) => parse_var(&lookup, "HTTP_PORT", defaults.http_port)?,
            None => parse_var(&lookup, "PORT", defaults.http_port)?,
        };

        let client_buffer_size =
            parse_var(&lookup, "CLIENT_BUFFER_SIZE", defaults.client_buffer_size)?;
        if client_buffer_size == 0 {
            return Err(GatewayError::Config(
                "CLIENT_BUFFER_SIZE must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            http_port,
            metrics_port: parse_var(&lookup, "METRICS_PORT", defaults.metrics_port)?,
            store_backend: parse_var(&lookup, "STORE_BACKEND", defaults.store_backend)?,
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: lookup("CART_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            resource_model: parse_var(&lookup, "RESOURCE_MODEL", defaults.resource_model)?,
            poll_interval: parse_secs(&lookup, "POLL_INTERVAL_SECS", defaults.poll_interval)?,
            feed_setup_timeout: parse_secs(
                &lookup,
                "FEED_SETUP_TIMEOUT_SECS",
                defaults.feed_setup_timeout,
            )?,
            client_buffer_size,
            ping_interval: parse_secs(&lookup, "PING_INTERVAL_SECS", defaults.ping_interval)?,
        })
    }

    /// Change source timing derived from this configuration.
    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            poll_interval: self.poll_interval,
            feed_setup_timeout: self.feed_setup_timeout,
        }
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        info!("Configuration:");
        info!("  HTTP_PORT: {}", self.http_port);
        info!("  METRICS_PORT: {}", self.metrics_port);
        info!("  STORE_BACKEND: {:?}", self.store_backend);
        info!("  REDIS_URL: {}", self.redis_url);
        info!("  CART_KEY_PREFIX: {}", self.key_prefix);
        info!("  RESOURCE_MODEL: {}", self.resource_model);
        info!("  POLL_INTERVAL_SECS: {}", self.poll_interval.as_secs());
        info!("  FEED_SETUP_TIMEOUT_SECS: {}", self.feed_setup_timeout.as_secs());
    }
}
