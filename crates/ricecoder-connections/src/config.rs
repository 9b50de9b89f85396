//! Configuration for pools, the connection handler and health monitoring
//!
//! All durations are stored in milliseconds so the same structures can be
//! read from YAML or JSON config files.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Configuration for a per-provider connection pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on idle + in-use connections per provider
    pub max_size: usize,
    /// Number of connections created by `warm_up` and kept by idle eviction
    pub min_size: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_size: 0,
            acquire_timeout_ms: 30_000,
            idle_timeout_ms: 300_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Checks the pool bounds
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::ConfigError(
                "pool max_size must be at least 1".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(Error::ConfigError(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Retry and timeout policy for the active-provider connection handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Deadline for a single connect attempt
    pub connection_timeout_ms: u64,
    pub reconnect_on_error: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            connection_timeout_ms: 10_000,
            reconnect_on_error: true,
        }
    }
}

impl HandlerConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Delay before retry number `attempt` (zero-based):
    /// `min(initial * 2^attempt, max)`
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.initial_retry_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_retry_delay_ms > self.max_retry_delay_ms {
            return Err(Error::ConfigError(format!(
                "initial_retry_delay_ms ({}) exceeds max_retry_delay_ms ({})",
                self.initial_retry_delay_ms, self.max_retry_delay_ms
            )));
        }
        if self.connection_timeout_ms == 0 {
            return Err(Error::ConfigError(
                "connection_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for periodic model health probes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Probe interval used when a provider does not declare its own
    pub interval_ms: u64,
    /// Deadline for a single probe; an expired probe counts as a failure
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            timeout_ms: 10_000,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(Error::ConfigError(
                "health check interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration for the connection layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    pub pool: PoolConfig,
    pub handler: HandlerConfig,
    pub health: HealthCheckConfig,
}

impl ConnectionsConfig {
    /// Parses a JSON document; missing sections take their defaults
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML document; missing sections take their defaults
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a `.json`, `.yaml` or `.yml` file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        debug!("Loading connection config from {:?}", path);
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            _ => Err(Error::ConfigError(format!(
                "Unsupported config file format: {:?}",
                path
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.handler.validate()?;
        self.health.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let config = HandlerConfig {
            initial_retry_delay_ms: 100,
            max_retry_delay_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
        assert_eq!(config.retry_delay(1), Duration::from_millis(200));
        assert_eq!(config.retry_delay(2), Duration::from_millis(400));
        assert_eq!(config.retry_delay(3), Duration::from_millis(500));
        assert_eq!(config.retry_delay(80), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            ConnectionsConfig::from_json_str(r#"{"pool": {"max_size": 2}}"#).unwrap();
        assert_eq!(config.pool.max_size, 2);
        assert_eq!(config.pool.acquire_timeout_ms, 30_000);
        assert_eq!(config.handler, HandlerConfig::default());
    }

    #[test]
    fn test_yaml_config() {
        let yaml = "handler:\n  max_retries: 5\n  reconnect_on_error: false\n";
        let config = ConnectionsConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.handler.max_retries, 5);
        assert!(!config.handler.reconnect_on_error);
    }

    #[test]
    fn test_invalid_pool_bounds() {
        let result = ConnectionsConfig::from_json_str(
            r#"{"pool": {"max_size": 2, "min_size": 3}}"#,
        );
        assert!(matches!(result, Err(Error::ConfigError(_))));

        let zero = PoolConfig {
            max_size: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.yaml");
        std::fs::write(&path, "health:\n  interval_ms: 500\n").unwrap();

        let config = ConnectionsConfig::load_from_file(&path).unwrap();
        assert_eq!(config.health.interval(), Duration::from_millis(500));

        let bad = dir.path().join("connections.toml");
        std::fs::write(&bad, "").unwrap();
        assert!(ConnectionsConfig::load_from_file(&bad).is_err());
    }
}
