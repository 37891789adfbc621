//! Connector configuration
//!
//! Loaded from YAML with `${VAR}` / `${VAR:-default}` environment expansion:
//!
//! ```yaml
//! pool:
//!   max_connections: 8
//!   acquire_timeout_ms: 5000
//! circuit_breaker:
//!   failure_threshold: 3
//! rate_limiter:
//!   default:
//!     requests_per_window: 50
//!     window_size_ms: 1000
//!   per_data_source:
//!     graphql:
//!       requests_per_window: 10
//! data_sources:
//!   - id: products
//!     type: graphql
//!     endpoint: ${PRODUCTS_URL:-https://api.example.com/graphql}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::connection::DataSourceConfig;
use crate::error::{Error, Result};
use crate::metrics::DEFAULT_METRICS_CAPACITY;
use crate::pool::PoolConfig;
use crate::rate_limiter::RateLimiterConfig;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration of a [`DataSourceConnector`](crate::connector::DataSourceConnector)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Pooling for data sources that do not configure their own; `None` = direct calls
    #[serde(default)]
    pub pool: Option<PoolConfig>,
    /// Breaker settings; `None` disables circuit breaking
    #[serde(default = "default_circuit_breaker")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Rate limiting
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    /// Number of operation metrics kept
    #[serde(default = "default_metrics_capacity")]
    pub metrics_capacity: usize,
    /// Deadline for connect/disconnect/direct queries when a data source sets none
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// Declared data sources
    #[serde(default)]
    pub data_sources: Vec<DataSourceConfig>,
}

fn default_circuit_breaker() -> Option<CircuitBreakerConfig> {
    Some(CircuitBreakerConfig::default())
}

fn default_metrics_capacity() -> usize {
    DEFAULT_METRICS_CAPACITY
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            pool: None,
            circuit_breaker: default_circuit_breaker(),
            rate_limiter: RateLimiterConfig::default(),
            metrics_capacity: default_metrics_capacity(),
            operation_timeout_ms: default_operation_timeout_ms(),
            data_sources: Vec::new(),
        }
    }
}

impl ConnectorConfig {
    /// Enable pooling by default
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set breaker defaults
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Disable circuit breaking
    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = None;
        self
    }

    /// Set rate limiting
    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = config;
        self
    }

    /// Set the metrics ring size
    pub fn with_metrics_capacity(mut self, capacity: usize) -> Self {
        self.metrics_capacity = capacity;
        self
    }

    /// Set the default operation deadline
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Declare a data source
    pub fn with_data_source(mut self, data_source: DataSourceConfig) -> Self {
        self.data_sources.push(data_source);
        self
    }

    /// Default operation deadline as a duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Look up a declared data source
    pub fn data_source(&self, id: &str) -> Option<&DataSourceConfig> {
        self.data_sources.iter().find(|ds| ds.id == id)
    }

    /// Parse YAML, expanding environment variables first
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.validate()?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }

        self.rate_limiter.default.validate()?;
        for (data_source, rule) in &self.rate_limiter.per_data_source {
            rule.validate().map_err(|e| {
                Error::validation(format!("rate limit for '{}': {}", data_source, e))
            })?;
        }

        let mut seen = HashSet::new();
        for ds in &self.data_sources {
            if ds.id.is_empty() {
                return Err(Error::validation("data source id cannot be empty"));
            }
            if !seen.insert(ds.id.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate data source id '{}'",
                    ds.id
                )));
            }
            if let Some(pool) = &ds.pool {
                pool.validate()?;
            }
            if let Some(breaker) = &ds.circuit_breaker {
                breaker.validate()?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectorConfig::default();
        assert!(config.pool.is_none());
        assert!(config.circuit_breaker.is_some());
        assert!(config.rate_limiter.enabled);
        assert_eq!(config.metrics_capacity, 1_000);
        assert_eq!(config.operation_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = ConnectorConfig::from_yaml_str("{}").unwrap();
        assert!(config.pool.is_none());
        assert_eq!(
            config.circuit_breaker.unwrap().failure_threshold,
            CircuitBreakerConfig::default().failure_threshold
        );
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("SIFT_TEST_EXPAND_HOST", "search.internal");
        std::env::remove_var("SIFT_TEST_EXPAND_MISSING");

        let expanded = ConnectorConfig::expand_env_vars(
            "a: ${SIFT_TEST_EXPAND_HOST}\n\
             b: ${SIFT_TEST_EXPAND_MISSING:-fallback}\n\
             c: ${SIFT_TEST_EXPAND_MISSING}",
        );
        assert_eq!(expanded, "a: search.internal\nb: fallback\nc: ");
    }

    #[test]
    fn test_breaker_can_be_disabled() {
        let config = ConnectorConfig::from_yaml_str("circuit_breaker: null").unwrap();
        assert!(config.circuit_breaker.is_none());
    }

    #[test]
    fn test_rejects_duplicate_data_sources() {
        let yaml = r#"
data_sources:
  - id: products
    type: memory
  - id: products
    type: sql
"#;
        let err = ConnectorConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_invalid_pool() {
        let err = ConnectorConfig::from_yaml_str("pool:\n  max_connections: 0").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
