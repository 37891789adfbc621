//! Data-source connector
//!
//! Single entry point for talking to search backends. For every call the
//! connector:
//! 1. Checks the rate limiter (client id from [`QueryContext`])
//! 2. Runs the source type's [`SecurityValidator`]
//! 3. Resolves the adapter for the data source's type
//! 4. Calls the adapter through the data source's circuit breaker, either on a
//!    pooled connection with retries or on a direct connect/query/disconnect
//! 5. Records a [`QueryMetric`] and annotates any error with [`ErrorContext`]
//!
//! # Example
//!
//! ```rust,ignore
//! use sift_access::prelude::*;
//!
//! let connector = DataSourceConnector::new(
//!     ConnectorConfig::default().with_pool(PoolConfig::default().with_max_connections(4)),
//! );
//! connector.register_adapter("graphql", Arc::new(GraphqlAdapterFactory::new()));
//!
//! let products = DataSourceConfig::new("products", "graphql")
//!     .with_endpoint("https://api.example.com/graphql");
//!
//! let hits = connector
//!     .execute_query(&products, &SearchQuery::new("red shoes"), &QueryContext::for_client("web"))
//!     .await?;
//!
//! connector.destroy().await;
//! ```

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerRegistry};
use crate::config::ConnectorConfig;
use crate::connection::{
    AdapterCapabilities, AdapterConnectionFactory, Connection, DataSourceAdapter,
    DataSourceConfig, SearchQuery, SearchResult, SourceType,
};
use crate::error::{Error, ErrorContext, ErrorKind, Result};
use crate::metrics::{PerformanceMetrics, PerformanceSummary, QueryMetric};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::rate_limiter::{RateLimiter, RateLimiterStats};
use crate::registry::{AdapterFactory, AdapterRegistry};
use crate::security::{DefaultSecurityValidator, SecurityValidator};

/// Client id used when a request carries none
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Per-request information supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryContext {
    /// Rate limiting identity
    #[serde(default)]
    pub client_id: Option<String>,
    /// Correlation id for logs
    #[serde(default)]
    pub request_id: Option<String>,
}

impl QueryContext {
    /// An anonymous context
    pub fn new() -> Self {
        Self::default()
    }

    /// A context for a known client
    pub fn for_client(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            request_id: None,
        }
    }

    /// Set the correlation id
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Client id, or [`ANONYMOUS_CLIENT`]
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(ANONYMOUS_CLIENT)
    }
}

/// Outcome of [`DataSourceConnector::test_connection`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionTestResult {
    /// Connected and passed the health check
    pub success: bool,
    /// Time spent connecting and checking
    pub latency_ms: u64,
    /// Failure description
    pub message: Option<String>,
    /// Failure code
    pub error_code: Option<String>,
    /// What the adapter supports, when it could be resolved
    pub capabilities: Option<AdapterCapabilities>,
}

/// Routes calls to adapters with rate limiting, security checks, pooling and circuit breaking
pub struct DataSourceConnector {
    config: ConnectorConfig,
    registry: RwLock<AdapterRegistry>,
    /// Adapters replaced by re-registration; live pools may still use them
    retired: Mutex<Vec<(SourceType, Arc<dyn DataSourceAdapter>)>>,
    validators: RwLock<HashMap<SourceType, Arc<dyn SecurityValidator>>>,
    default_validator: Arc<dyn SecurityValidator>,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    breakers: CircuitBreakerRegistry,
    rate_limiter: Arc<RateLimiter>,
    metrics: PerformanceMetrics,
    destroyed: AtomicBool,
}

impl DataSourceConnector {
    /// Create a connector
    ///
    /// Starts the rate limiter's cleanup task when called inside a tokio runtime.
    pub fn new(config: ConnectorConfig) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone()));
        if tokio::runtime::Handle::try_current().is_ok() {
            rate_limiter.start_cleanup();
        }

        Self {
            breakers: CircuitBreakerRegistry::new(
                config.circuit_breaker.clone().unwrap_or_default(),
            ),
            metrics: PerformanceMetrics::new(config.metrics_capacity),
            registry: RwLock::new(AdapterRegistry::new()),
            retired: Mutex::new(Vec::new()),
            validators: RwLock::new(HashMap::new()),
            default_validator: Arc::new(DefaultSecurityValidator::new()),
            pools: RwLock::new(HashMap::new()),
            rate_limiter,
            destroyed: AtomicBool::new(false),
            config,
        }
    }

    /// Connector configuration
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Register an adapter factory for a source type
    ///
    /// Pools created before re-registration keep the adapter they were built with;
    /// the replaced adapter is destroyed together with the connector.
    pub fn register_adapter(
        &self,
        source_type: impl Into<SourceType>,
        factory: Arc<dyn AdapterFactory>,
    ) {
        let source_type = source_type.into();
        let replaced = self.registry.write().register(source_type.clone(), factory);
        if let Some(adapter) = replaced {
            debug!(source_type = %source_type, "retired cached adapter");
            self.retired.lock().push((source_type.clone(), adapter));
        }
        info!(source_type = %source_type, "registered adapter");
    }

    /// Source types with a registered factory
    pub fn registered_types(&self) -> Vec<SourceType> {
        self.registry.read().types()
    }

    /// Use `validator` for every data source of `source_type`
    pub fn register_validator(
        &self,
        source_type: impl Into<SourceType>,
        validator: Arc<dyn SecurityValidator>,
    ) {
        self.validators.write().insert(source_type.into(), validator);
    }

    /// Open a direct connection
    pub async fn connect(&self, data_source: &DataSourceConfig) -> Result<Connection> {
        let start = Instant::now();
        let result = async {
            self.ensure_alive()?;
            self.validator_for(&data_source.source_type)
                .validate_config(data_source)?;
            let adapter = self.adapter_for(&data_source.source_type)?;
            with_deadline("connect", self.timeout_for(data_source), adapter.connect(data_source))
                .await
        }
        .await;

        self.finish(data_source, "connect", start, result, |_| 0)
    }

    /// Query on a connection obtained from [`connect`](Self::connect)
    pub async fn query(
        &self,
        data_source: &DataSourceConfig,
        connection: &Connection,
        query: &SearchQuery,
        ctx: &QueryContext,
    ) -> Result<Vec<SearchResult>> {
        let start = Instant::now();
        let result = async {
            let adapter = self.admit(data_source, query, ctx)?;
            self.run_query(data_source, &adapter, connection, query).await
        }
        .await;

        self.finish(data_source, "query", start, result, Vec::len)
    }

    /// Close a connection obtained from [`connect`](Self::connect)
    pub async fn disconnect(
        &self,
        data_source: &DataSourceConfig,
        connection: &Connection,
    ) -> Result<()> {
        let start = Instant::now();
        let result = async {
            let adapter = self.adapter_for(&data_source.source_type)?;
            with_deadline(
                "disconnect",
                self.timeout_for(data_source),
                adapter.disconnect(connection),
            )
            .await
        }
        .await;

        self.finish(data_source, "disconnect", start, result, |_| 0)
    }

    /// Run a query end to end
    ///
    /// Pooled data sources use the pool's retrying executor; the rest connect,
    /// query and always attempt to disconnect.
    pub async fn execute_query(
        &self,
        data_source: &DataSourceConfig,
        query: &SearchQuery,
        ctx: &QueryContext,
    ) -> Result<Vec<SearchResult>> {
        let start = Instant::now();
        let result = async {
            let adapter = self.admit(data_source, query, ctx)?;
            debug!(
                data_source = %data_source.id,
                client_id = ctx.client_id(),
                request_id = ctx.request_id.as_deref().unwrap_or("-"),
                "executing query"
            );

            match self.pool_config_for(data_source, adapter.as_ref()) {
                Some(pool_config) => {
                    let pool = self.pool_for(data_source, &adapter, pool_config);
                    let adapter = &adapter;
                    pool.execute_with_retry(data_source, |conn| async move {
                        self.run_query(data_source, adapter, &conn, query).await
                    })
                    .await
                }
                None => self.direct_query(data_source, &adapter, query).await,
            }
        }
        .await;

        self.finish(data_source, "execute_query", start, result, Vec::len)
    }

    /// Connect, health-check and disconnect, reporting instead of failing
    pub async fn test_connection(&self, data_source: &DataSourceConfig) -> ConnectionTestResult {
        let start = Instant::now();
        let mut capabilities = None;

        let result = async {
            self.ensure_alive()?;
            self.validator_for(&data_source.source_type)
                .validate_config(data_source)?;
            let adapter = self.adapter_for(&data_source.source_type)?;
            capabilities = Some(adapter.capabilities());

            let timeout = self.timeout_for(data_source);
            let connection = with_deadline("connect", timeout, adapter.connect(data_source)).await?;
            let healthy = adapter.health_check(&connection).await;
            self.disconnect_quietly(data_source, &adapter, &connection).await;

            if healthy {
                Ok(())
            } else {
                Err(Error::connection("health check failed"))
            }
        }
        .await;

        let latency_ms = start.elapsed().as_millis() as u64;
        let outcome = self.finish(data_source, "test_connection", start, result, |_| 0);
        match outcome {
            Ok(()) => ConnectionTestResult {
                success: true,
                latency_ms,
                message: None,
                error_code: None,
                capabilities,
            },
            Err(e) => ConnectionTestResult {
                success: false,
                latency_ms,
                message: Some(e.root().to_string()),
                error_code: Some(e.code().to_string()),
                capabilities,
            },
        }
    }

    /// Summary of recent operations
    pub fn performance_metrics(&self) -> PerformanceSummary {
        self.metrics.summary()
    }

    /// The `n` most recent operation metrics
    pub fn recent_metrics(&self, n: usize) -> Vec<QueryMetric> {
        self.metrics.recent(n)
    }

    /// Pool statistics keyed by data source id
    pub fn connection_pool_stats(&self) -> BTreeMap<String, PoolStats> {
        self.pools
            .read()
            .iter()
            .map(|(id, pool)| (id.clone(), pool.stats()))
            .collect()
    }

    /// Metrics of every circuit breaker created so far
    pub fn circuit_breaker_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        self.breakers.all_metrics()
    }

    /// The connector's rate limiter
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Rate limiter counters
    pub fn rate_limiter_stats(&self) -> RateLimiterStats {
        self.rate_limiter.stats()
    }

    /// Whether `destroy` has been called
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Tear everything down; later calls do nothing and this never fails
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.rate_limiter.shutdown();

        let pools: Vec<_> = self.pools.write().drain().map(|(_, pool)| pool).collect();
        futures::future::join_all(pools.iter().map(|pool| pool.destroy())).await;

        let mut adapters = self.registry.write().drain_cached();
        adapters.extend(self.retired.lock().drain(..));
        for (source_type, adapter) in &adapters {
            if let Err(e) = adapter.destroy().await {
                warn!(source_type = %source_type, error = %e, "adapter teardown failed");
            }
        }

        info!(
            pools = pools.len(),
            adapters = adapters.len(),
            "data source connector destroyed"
        );
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(Error::internal("connector has been destroyed"))
        } else {
            Ok(())
        }
    }

    /// Rate limit, security checks and adapter resolution shared by query paths
    fn admit(
        &self,
        data_source: &DataSourceConfig,
        query: &SearchQuery,
        ctx: &QueryContext,
    ) -> Result<Arc<dyn DataSourceAdapter>> {
        self.ensure_alive()?;

        let client_id = ctx.client_id();
        self.rate_limiter
            .check_limit(client_id, query, Some(data_source.source_type.as_str()))
            .into_result(client_id)?;

        let validator = self.validator_for(&data_source.source_type);
        validator.validate_config(data_source)?;
        validator.validate_query(data_source, query)?;

        self.adapter_for(&data_source.source_type)
    }

    fn adapter_for(&self, source_type: &SourceType) -> Result<Arc<dyn DataSourceAdapter>> {
        self.registry
            .write()
            .get_or_create(source_type)
            .unwrap_or_else(|| {
                Err(Error::validation(format!(
                    "no adapter registered for source type '{}'",
                    source_type
                )))
            })
    }

    fn validator_for(&self, source_type: &SourceType) -> Arc<dyn SecurityValidator> {
        self.validators
            .read()
            .get(source_type)
            .cloned()
            .unwrap_or_else(|| self.default_validator.clone())
    }

    fn timeout_for(&self, data_source: &DataSourceConfig) -> Duration {
        if data_source.timeout_ms > 0 {
            Duration::from_millis(data_source.timeout_ms)
        } else {
            self.config.operation_timeout()
        }
    }

    fn breaker_for(&self, data_source: &DataSourceConfig) -> Option<Arc<CircuitBreaker>> {
        match (&data_source.circuit_breaker, &self.config.circuit_breaker) {
            (Some(custom), _) => Some(self.breakers.get_or_create_with(&data_source.id, custom)),
            (None, Some(_)) => Some(self.breakers.get_or_create(&data_source.id)),
            (None, None) => None,
        }
    }

    fn pool_config_for(
        &self,
        data_source: &DataSourceConfig,
        adapter: &dyn DataSourceAdapter,
    ) -> Option<PoolConfig> {
        if !adapter.capabilities().pooling {
            return None;
        }
        data_source.pool.clone().or_else(|| self.config.pool.clone())
    }

    fn pool_for(
        &self,
        data_source: &DataSourceConfig,
        adapter: &Arc<dyn DataSourceAdapter>,
        config: PoolConfig,
    ) -> Arc<ConnectionPool> {
        if let Some(pool) = self.pools.read().get(&data_source.id) {
            return pool.clone();
        }

        self.pools
            .write()
            .entry(data_source.id.clone())
            .or_insert_with(|| {
                debug!(
                    data_source = %data_source.id,
                    max_connections = config.max_connections,
                    "creating connection pool"
                );
                let factory = AdapterConnectionFactory::new(adapter.clone());
                ConnectionPool::new(config, Arc::new(factory))
            })
            .clone()
    }

    async fn run_query(
        &self,
        data_source: &DataSourceConfig,
        adapter: &Arc<dyn DataSourceAdapter>,
        connection: &Connection,
        query: &SearchQuery,
    ) -> Result<Vec<SearchResult>> {
        match self.breaker_for(data_source) {
            Some(breaker) => breaker.execute(|| adapter.query(connection, query)).await,
            None => {
                with_deadline(
                    "query",
                    self.timeout_for(data_source),
                    adapter.query(connection, query),
                )
                .await
            }
        }
    }

    async fn direct_query(
        &self,
        data_source: &DataSourceConfig,
        adapter: &Arc<dyn DataSourceAdapter>,
        query: &SearchQuery,
    ) -> Result<Vec<SearchResult>> {
        let connection = with_deadline(
            "connect",
            self.timeout_for(data_source),
            adapter.connect(data_source),
        )
        .await?;

        let result = self.run_query(data_source, adapter, &connection, query).await;
        self.disconnect_quietly(data_source, adapter, &connection).await;
        result
    }

    async fn disconnect_quietly(
        &self,
        data_source: &DataSourceConfig,
        adapter: &Arc<dyn DataSourceAdapter>,
        connection: &Connection,
    ) {
        let disconnect = with_deadline(
            "disconnect",
            self.timeout_for(data_source),
            adapter.disconnect(connection),
        );
        if let Err(e) = disconnect.await {
            debug!(
                data_source = %data_source.id,
                connection = %connection.id,
                error = %e,
                "ignoring disconnect failure"
            );
        }
    }

    /// Record the metric and attach context to a failure
    fn finish<T>(
        &self,
        data_source: &DataSourceConfig,
        operation: &str,
        start: Instant,
        result: Result<T>,
        count: impl Fn(&T) -> usize,
    ) -> Result<T> {
        let elapsed = start.elapsed();
        let metric = QueryMetric::success(
            data_source.id.as_str(),
            data_source.source_type.as_str(),
            operation,
            elapsed,
        );

        match result {
            Ok(value) => {
                self.metrics.record(metric.with_result_count(count(&value)));
                debug!(
                    data_source = %data_source.id,
                    operation,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "operation succeeded"
                );
                Ok(value)
            }
            Err(e) => {
                self.metrics.record(metric.with_error(e.code()));
                let e = e.with_context(
                    ErrorContext::new()
                        .with_data_source(data_source.id.as_str())
                        .with_source_type(data_source.source_type.as_str())
                        .with_operation(operation),
                );
                match e.kind() {
                    ErrorKind::RateLimit | ErrorKind::CircuitOpen => debug!(
                        data_source = %data_source.id,
                        operation,
                        error = %e,
                        "request rejected"
                    ),
                    _ => warn!(
                        data_source = %data_source.id,
                        operation,
                        error = %e,
                        "operation failed"
                    ),
                }
                Err(e)
            }
        }
    }
}

async fn with_deadline<T>(
    operation: &str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| Err(Error::operation_timeout(operation, timeout)))
}
