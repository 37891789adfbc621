//! # sift-access
//!
//! Resilient data-source access for the Sift client-side search library.
//!
//! Search backends (GraphQL endpoints, SQL databases, in-memory stores, ...)
//! are reached through pluggable adapters. This crate puts the plumbing around
//! them so every call is bounded, fair and fails fast.
//!
//! ## Features
//!
//! - **Connection Pooling**: bounded pools with FIFO waiters, idle eviction and validation
//! - **Circuit Breaking**: per data source, with exponential cool-down and half-open probes
//! - **Rate Limiting**: sliding window plus token bucket per client, failing open on bad rules
//! - **Adapter Routing**: factories registered by source type, created lazily and cached
//! - **Security Checks**: identifier, endpoint scheme and query text validation
//! - **Performance Metrics**: bounded ring of recent operations with latency summaries
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sift_access::prelude::*;
//!
//! let config = ConnectorConfig::from_file("sift.yaml")?;
//! let connector = DataSourceConnector::new(config);
//! connector.register_adapter("sql", Arc::new(SqlAdapterFactory::default()));
//!
//! let ds = connector.config().data_source("orders").cloned().unwrap();
//! let hits = connector
//!     .execute_query(&ds, &SearchQuery::new("invoice 42").with_limit(20), &QueryContext::new())
//!     .await?;
//!
//! println!("{:#?}", connector.performance_metrics());
//! connector.destroy().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod security;
pub mod testing;

pub use connector::DataSourceConnector;
pub use error::{Error, ErrorContext, ErrorKind, Result};

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorContext, ErrorKind, Result};

    // Connections and adapters
    pub use crate::connection::{
        AdapterCapabilities, AdapterConnectionFactory, Connection, ConnectionFactory,
        ConnectionId, ConnectionStatus, DataSourceAdapter, DataSourceConfig, SearchQuery,
        SearchResult, SourceType,
    };
    pub use crate::registry::{AdapterFactory, AdapterRegistry};

    // Resilience
    pub use crate::circuit_breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerRegistry,
        CircuitState,
    };
    pub use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
    pub use crate::rate_limiter::{
        RateLimitDecision, RateLimitRule, RateLimiter, RateLimiterConfig,
    };
    pub use crate::retry::RetryPolicy;

    // Security
    pub use crate::security::{DefaultSecurityValidator, SecurityValidator};

    // Connector
    pub use crate::config::ConnectorConfig;
    pub use crate::connector::{ConnectionTestResult, DataSourceConnector, QueryContext};
    pub use crate::metrics::{PerformanceSummary, QueryMetric};

    pub use std::sync::Arc;
}
