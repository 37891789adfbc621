//! Test doubles for adapters
//!
//! [`MockAdapter`] is a programmable in-memory backend: canned results,
//! scripted failures, artificial latency and call counters. Clones share
//! state, so a test can keep one handle while the connector owns another.
//!
//! # Example
//!
//! ```rust,ignore
//! use sift_access::testing::*;
//!
//! #[tokio::test]
//! async fn test_retry_recovers() {
//!     let adapter = MockAdapter::new()
//!         .with_results(vec![SearchResult::new("1", 0.9)])
//!         .fail_next_queries(2);
//!
//!     let connector = DataSourceConnector::new(config);
//!     connector.register_adapter("memory", Arc::new(MockAdapterFactory::new(adapter.clone())));
//!
//!     let hits = connector.execute_query(&ds, &query, &ctx).await.unwrap();
//!     assert_eq!(adapter.query_count(), 3);
//! }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{
    AdapterCapabilities, Connection, ConnectionId, DataSourceAdapter, DataSourceConfig,
    SearchQuery, SearchResult,
};
use crate::error::{Error, Result};
use crate::registry::AdapterFactory;

#[derive(Debug, Default)]
struct MockState {
    results: Mutex<Vec<SearchResult>>,
    connect_latency: Mutex<Duration>,
    query_latency: Mutex<Duration>,
    health_check_latency: Mutex<Duration>,
    connect_failures: AtomicU32,
    retryable_query_failures: AtomicU32,
    fatal_query_failures: AtomicU32,
    fail_disconnects: AtomicBool,
    unhealthy: AtomicBool,
    unhealthy_ids: Mutex<HashSet<ConnectionId>>,
    open: Mutex<HashSet<ConnectionId>>,
    disconnected: Mutex<Vec<ConnectionId>>,
    max_open: AtomicUsize,
    connects: AtomicUsize,
    queries: AtomicUsize,
    disconnects: AtomicUsize,
    health_checks: AtomicUsize,
    destroys: AtomicUsize,
}

/// A mock adapter for testing
#[derive(Debug, Clone, Default)]
pub struct MockAdapter {
    state: Arc<MockState>,
}

impl MockAdapter {
    /// Create a healthy adapter returning no results
    pub fn new() -> Self {
        Self::default()
    }

    /// Results returned by every successful query
    pub fn with_results(self, results: Vec<SearchResult>) -> Self {
        *self.state.results.lock() = results;
        self
    }

    /// Delay every connect
    pub fn with_connect_latency(self, latency: Duration) -> Self {
        *self.state.connect_latency.lock() = latency;
        self
    }

    /// Delay every query
    pub fn with_query_latency(self, latency: Duration) -> Self {
        *self.state.query_latency.lock() = latency;
        self
    }

    /// Delay every health check
    pub fn with_health_check_latency(self, latency: Duration) -> Self {
        *self.state.health_check_latency.lock() = latency;
        self
    }

    /// Fail the next `n` connects with a connection error
    pub fn fail_next_connects(self, n: u32) -> Self {
        self.state.connect_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` queries with a retryable error
    pub fn fail_next_queries(self, n: u32) -> Self {
        self.state.retryable_query_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` queries with a non-retryable error
    pub fn fail_next_queries_fatal(self, n: u32) -> Self {
        self.state.fatal_query_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Make disconnect fail
    pub fn fail_disconnects(self) -> Self {
        self.state.fail_disconnects.store(true, Ordering::SeqCst);
        self
    }

    /// Toggle the health check result for every connection
    pub fn set_healthy(&self, healthy: bool) {
        self.state.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    /// Fail the health check for one connection
    pub fn mark_unhealthy(&self, id: ConnectionId) {
        self.state.unhealthy_ids.lock().insert(id);
    }

    /// Script more query failures at runtime
    pub fn script_query_failures(&self, retryable: u32, fatal: u32) {
        self.state
            .retryable_query_failures
            .store(retryable, Ordering::SeqCst);
        self.state.fatal_query_failures.store(fatal, Ordering::SeqCst);
    }

    /// Number of `connect` calls
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of `query` calls
    pub fn query_count(&self) -> usize {
        self.state.queries.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls
    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Number of `health_check` calls
    pub fn health_check_count(&self) -> usize {
        self.state.health_checks.load(Ordering::SeqCst)
    }

    /// Number of `destroy` calls
    pub fn destroy_count(&self) -> usize {
        self.state.destroys.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.state.open.lock().len()
    }

    /// Most connections ever open at once
    pub fn max_open_connections(&self) -> usize {
        self.state.max_open.load(Ordering::SeqCst)
    }

    /// Ids passed to `disconnect`, in call order
    pub fn disconnected_ids(&self) -> Vec<ConnectionId> {
        self.state.disconnected.lock().clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DataSourceAdapter for MockAdapter {
    async fn connect(&self, config: &DataSourceConfig) -> Result<Connection> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let latency = *self.state.connect_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if Self::take_failure(&self.state.connect_failures) {
            return Err(Error::connection(format!(
                "mock connect to '{}' failed",
                config.id
            )));
        }

        let connection = Connection::new(config.source_type.clone())
            .connected()
            .with_metadata("data_source", config.id.clone());
        let mut open = self.state.open.lock();
        open.insert(connection.id);
        self.state.max_open.fetch_max(open.len(), Ordering::SeqCst);
        Ok(connection)
    }

    async fn query(
        &self,
        connection: &Connection,
        query: &SearchQuery,
    ) -> Result<Vec<SearchResult>> {
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        let latency = *self.state.query_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !self.state.open.lock().contains(&connection.id) {
            return Err(Error::connection("mock connection is closed"));
        }
        if Self::take_failure(&self.state.fatal_query_failures) {
            return Err(Error::query(format!("mock query '{}' rejected", query.text)));
        }
        if Self::take_failure(&self.state.retryable_query_failures) {
            return Err(Error::query_retryable("mock backend temporarily unavailable"));
        }

        let mut results = self.state.results.lock().clone();
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn disconnect(&self, connection: &Connection) -> Result<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.open.lock().remove(&connection.id);
        self.state.disconnected.lock().push(connection.id);
        if self.state.fail_disconnects.load(Ordering::SeqCst) {
            return Err(Error::connection("mock disconnect failed"));
        }
        Ok(())
    }

    async fn health_check(&self, connection: &Connection) -> bool {
        self.state.health_checks.fetch_add(1, Ordering::SeqCst);
        let latency = *self.state.health_check_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        !self.state.unhealthy.load(Ordering::SeqCst)
            && !self.state.unhealthy_ids.lock().contains(&connection.id)
            && self.state.open.lock().contains(&connection.id)
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            pagination: true,
            ..Default::default()
        }
    }

    async fn destroy(&self) -> Result<()> {
        self.state.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out clones of one [`MockAdapter`]
#[derive(Debug, Clone)]
pub struct MockAdapterFactory {
    adapter: MockAdapter,
    created: Arc<AtomicUsize>,
    fail: bool,
}

impl MockAdapterFactory {
    /// Wrap an adapter
    pub fn new(adapter: MockAdapter) -> Self {
        Self {
            adapter,
            created: Arc::new(AtomicUsize::new(0)),
            fail: false,
        }
    }

    /// A factory whose `create` always fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(MockAdapter::new())
        }
    }

    /// Number of adapters created
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl AdapterFactory for MockAdapterFactory {
    fn create(&self) -> Result<Arc<dyn DataSourceAdapter>> {
        if self.fail {
            return Err(Error::internal("mock adapter factory failure"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.adapter.clone()))
    }
}
