//! Connection pool for sift-access
//!
//! Bounded connection reuse with:
//! - Creation capped at `max_connections`, slots reserved before connecting
//! - Strict FIFO waiting once the pool is exhausted
//! - Validation on acquire and/or release
//! - Background eviction of idle connections
//! - Retrying execution with exponential backoff
//!
//! # Example
//!
//! ```rust,ignore
//! use sift_access::prelude::*;
//!
//! let pool = ConnectionPool::new(
//!     PoolConfig::default().with_max_connections(4),
//!     Arc::new(AdapterConnectionFactory::new(adapter)),
//! );
//!
//! let hits = pool
//!     .execute_with_retry(&config, |conn| {
//!         let adapter = adapter.clone();
//!         let query = query.clone();
//!         async move { adapter.query(&conn, &query).await }
//!     })
//!     .await?;
//! ```
//!
//! # Waiting
//!
//! When no idle connection exists and the pool is full, `acquire` takes a
//! ticket. Tickets are served strictly in order: a released connection, or a
//! creation slot freed by an eviction, always goes to the oldest live ticket.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionFactory, ConnectionId, DataSourceConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::retry::RetryPolicy;

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of connections (idle + in use)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle connections older than this are evicted (0 = never)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Deadline for creating one connection (0 = none)
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Maximum time to wait for a connection
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Validate idle connections before handing them out
    #[serde(default = "default_true")]
    pub validate_on_acquire: bool,
    /// Validate connections when they come back
    #[serde(default)]
    pub validate_on_release: bool,
    /// Retry policy for `execute_with_retry`
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_connections() -> usize {
    10
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            validate_on_acquire: true,
            validate_on_release: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Set maximum pool size
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set connection creation timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable/disable validation on acquire
    pub fn with_validate_on_acquire(mut self, validate: bool) -> Self {
        self.validate_on_acquire = validate;
        self
    }

    /// Enable/disable validation on release
    pub fn with_validate_on_release(mut self, validate: bool) -> Self {
        self.validate_on_release = validate;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Connection timeout as a duration
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Acquire timeout as a duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Reject configurations the pool cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::validation("pool max_connections must be at least 1"));
        }
        Ok(())
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Connections currently in the pool
    pub total: usize,
    /// Idle connections
    pub idle: usize,
    /// Connections handed out
    pub in_use: usize,
    /// Connections being created
    pub pending_creates: usize,
    /// Queued acquire calls
    pub waiting: usize,
    /// Configured maximum
    pub max_connections: usize,
    /// Total connections created
    pub connections_created: u64,
    /// Total connections destroyed
    pub connections_destroyed: u64,
    /// Successful acquisitions
    pub acquisitions: u64,
    /// Releases back into the pool
    pub releases: u64,
    /// Acquire calls that timed out
    pub acquire_timeouts: u64,
    /// Failed validations
    pub validation_failures: u64,
    /// Connections evicted for idleness
    pub idle_evictions: u64,
    /// Failed connection creations
    pub create_failures: u64,
    /// Retries performed by `execute_with_retry`
    pub retries: u64,
    /// Summed acquire latency in milliseconds
    pub total_wait_time_ms: u64,
}

impl PoolStats {
    /// Average acquire latency in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        if self.acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms as f64 / self.acquisitions as f64
        }
    }
}

/// Atomic pool counters
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_destroyed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub releases: AtomicU64,
    pub acquire_timeouts: AtomicU64,
    pub validation_failures: AtomicU64,
    pub idle_evictions: AtomicU64,
    pub create_failures: AtomicU64,
    pub retries: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
}

impl AtomicPoolStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        Self::bump(&self.connections_created);
    }

    /// Record a connection teardown
    pub fn record_destroyed(&self) {
        Self::bump(&self.connections_destroyed);
    }

    /// Record an acquisition and how long it took
    pub fn record_acquisition(&self, waited: Duration) {
        Self::bump(&self.acquisitions);
        self.total_wait_time_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a release
    pub fn record_release(&self) {
        Self::bump(&self.releases);
    }

    /// Record an acquire timeout
    pub fn record_timeout(&self) {
        Self::bump(&self.acquire_timeouts);
    }

    /// Record a failed validation
    pub fn record_validation_failure(&self) {
        Self::bump(&self.validation_failures);
    }

    /// Record an idle eviction
    pub fn record_eviction(&self) {
        Self::bump(&self.idle_evictions);
    }

    /// Record a failed creation
    pub fn record_create_failure(&self) {
        Self::bump(&self.create_failures);
    }

    /// Record a retry
    pub fn record_retry(&self) {
        Self::bump(&self.retries);
    }
}

/// Pool-side bookkeeping for one connection
struct PooledConnection {
    connection: Connection,
    in_use: bool,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
}

/// What a queued acquire receives
enum Grant {
    /// An idle connection, already marked in use
    Connection(Connection),
    /// Permission to create a connection, slot already reserved
    Slot,
}

type GrantSender = oneshot::Sender<Result<Grant>>;

#[derive(Default)]
struct PoolState {
    connections: HashMap<ConnectionId, PooledConnection>,
    pending_creates: usize,
    /// Ordered by ticket, so the first entry is the oldest waiter
    waiters: BTreeMap<u64, GrantSender>,
    next_ticket: u64,
}

impl PoolState {
    fn has_capacity(&self, max: usize) -> bool {
        self.connections.len() + self.pending_creates < max
    }

    /// Claim the most recently used idle connection
    fn claim_idle(&mut self) -> Option<Connection> {
        let entry = self
            .connections
            .values_mut()
            .filter(|e| !e.in_use)
            .max_by_key(|e| e.last_used_at)?;
        entry.in_use = true;
        Some(entry.connection.clone())
    }

    /// Put a claimed connection back without counting it as a use
    fn unclaim(&mut self, id: &ConnectionId) {
        if let Some(entry) = self.connections.get_mut(id) {
            entry.in_use = false;
        }
    }

    fn enqueue(&mut self, tx: GrantSender) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiters.insert(ticket, tx);
        ticket
    }

    fn idle_count(&self) -> usize {
        self.connections.values().filter(|e| !e.in_use).count()
    }
}

enum Step {
    Idle(Connection),
    Create,
    Wait(u64, oneshot::Receiver<Result<Grant>>),
}

/// Bounded, FIFO-fair connection pool
pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    stats: AtomicPoolStats,
    destroyed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a pool and start its idle sweeper
    ///
    /// The sweeper only starts when called inside a tokio runtime and
    /// `idle_timeout_ms` is non-zero.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            factory,
            state: Mutex::new(PoolState::default()),
            stats: AtomicPoolStats::new(),
            destroyed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });

        if pool.config.idle_timeout_ms > 0 {
            if tokio::runtime::Handle::try_current().is_ok() {
                Self::spawn_sweeper(&pool);
            } else {
                debug!("no tokio runtime, idle sweeping disabled");
            }
        }

        pool
    }

    fn spawn_sweeper(pool: &Arc<Self>) {
        let period = (pool.config.idle_timeout() / 2).max(Duration::from_millis(1));
        let weak: Weak<Self> = Arc::downgrade(pool);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if pool.is_destroyed() {
                    break;
                }
                pool.evict_idle().await;
            }
        });

        *pool.sweeper.lock() = Some(handle);
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether `destroy` has been called
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Current number of pooled connections
    pub fn size(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Number of queued acquire calls
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(Error::PoolDestroyed)
        } else {
            Ok(())
        }
    }

    /// Get a connection: reuse an idle one, create one, or wait in line
    pub async fn acquire(&self, config: &DataSourceConfig) -> Result<Connection> {
        self.ensure_alive()?;
        let start = Instant::now();

        loop {
            let step = {
                let mut state = self.state.lock();
                if let Some(conn) = state.claim_idle() {
                    Step::Idle(conn)
                } else if state.has_capacity(self.config.max_connections) {
                    state.pending_creates += 1;
                    Step::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    let ticket = state.enqueue(tx);
                    Step::Wait(ticket, rx)
                }
            };

            match step {
                Step::Idle(conn) => {
                    if self.config.validate_on_acquire {
                        let claim = ClaimGuard::new(self, conn.id);
                        let valid = self.factory.validate_connection(&conn).await;
                        claim.disarm();
                        if !valid {
                            debug!(
                                connection = %conn.id,
                                "idle connection failed validation, evicting"
                            );
                            self.stats.record_validation_failure();
                            self.discard(&conn).await;
                            continue;
                        }
                    }
                    return self.finish_acquire(conn, start);
                }
                Step::Create => {
                    let slot = SlotGuard::new(self);
                    return self.create_in_slot(slot, config, start).await;
                }
                Step::Wait(ticket, rx) => {
                    debug!(ticket, "pool exhausted, queueing acquire");
                    let waiter = WaitGuard::new(self, ticket, rx);
                    return self.wait_for_grant(waiter, config, start).await;
                }
            }
        }
    }

    fn finish_acquire(&self, conn: Connection, start: Instant) -> Result<Connection> {
        if self.is_destroyed() {
            return Err(Error::PoolDestroyed);
        }
        self.stats.record_acquisition(start.elapsed());
        Ok(conn)
    }

    /// Create a connection in a slot already reserved in `pending_creates`
    async fn create_in_slot(
        &self,
        slot: SlotGuard<'_>,
        config: &DataSourceConfig,
        start: Instant,
    ) -> Result<Connection> {
        let created = self.create_connection(config).await;

        let mut orphan = None;
        let result = {
            let mut state = self.state.lock();
            slot.disarm();
            state.pending_creates -= 1;

            match created {
                Ok(mut conn) if !self.is_destroyed() => {
                    conn.touch();
                    let now = Instant::now();
                    state.connections.insert(
                        conn.id,
                        PooledConnection {
                            connection: conn.clone(),
                            in_use: true,
                            created_at: now,
                            last_used_at: now,
                            use_count: 0,
                        },
                    );
                    Ok(conn)
                }
                Ok(conn) => {
                    orphan = Some(conn);
                    Err(Error::PoolDestroyed)
                }
                Err(e) => {
                    self.dispatch(&mut state);
                    Err(e)
                }
            }
        };

        if let Some(conn) = orphan {
            self.destroy_quietly(&conn).await;
            return result;
        }

        match &result {
            Ok(conn) => {
                self.stats.record_created();
                self.stats.record_acquisition(start.elapsed());
                debug!(
                    connection = %conn.id,
                    source = %conn.source_type,
                    "created pooled connection"
                );
            }
            Err(e) => {
                self.stats.record_create_failure();
                warn!(data_source = %config.id, error = %e, "failed to create pooled connection");
            }
        }
        result
    }

    async fn create_connection(&self, config: &DataSourceConfig) -> Result<Connection> {
        let timeout = self.config.connection_timeout();
        let result = if timeout.is_zero() {
            self.factory.create_connection(config).await
        } else {
            match tokio::time::timeout(timeout, self.factory.create_connection(config)).await {
                Ok(result) => result,
                Err(_) => return Err(Error::operation_timeout("connection creation", timeout)),
            }
        };

        result.map_err(|e| match e.kind() {
            ErrorKind::Connection
            | ErrorKind::OperationTimeout
            | ErrorKind::Validation
            | ErrorKind::Security => e,
            _ => Error::Connection {
                message: format!("failed to create connection: {}", e),
                source: Some(Box::new(e)),
            },
        })
    }

    async fn wait_for_grant(
        &self,
        mut waiter: WaitGuard<'_>,
        config: &DataSourceConfig,
        start: Instant,
    ) -> Result<Connection> {
        let timeout = self.config.acquire_timeout();
        let received = tokio::time::timeout(timeout, &mut waiter.rx).await;

        let grant = match received {
            Ok(Ok(grant)) => {
                waiter.complete();
                grant?
            }
            // sender dropped without a grant: only happens on teardown
            Ok(Err(_)) => {
                waiter.complete();
                return Err(Error::PoolDestroyed);
            }
            Err(_) => match waiter.cancel() {
                // granted at the same moment the timer fired
                Some(grant) => grant?,
                None => {
                    self.stats.record_timeout();
                    debug!(
                        waited_ms = start.elapsed().as_millis() as u64,
                        "acquire timed out"
                    );
                    return Err(Error::AcquireTimeout {
                        waited: start.elapsed(),
                    });
                }
            },
        };

        match grant {
            Grant::Connection(conn) => self.finish_acquire(conn, start),
            Grant::Slot => {
                let slot = SlotGuard::new(self);
                self.create_in_slot(slot, config, start).await
            }
        }
    }

    /// Serve waiters, oldest first, with idle connections or free capacity
    fn dispatch(&self, state: &mut PoolState) {
        while let Some((ticket, tx)) = state.waiters.pop_first() {
            let grant = if let Some(conn) = state.claim_idle() {
                Grant::Connection(conn)
            } else if state.has_capacity(self.config.max_connections) {
                state.pending_creates += 1;
                Grant::Slot
            } else {
                state.waiters.insert(ticket, tx);
                break;
            };

            // waiter went away; take the grant back and try the next one
            if let Err(Ok(grant)) = tx.send(Ok(grant)) {
                Self::revoke(state, grant);
            }
        }
    }

    fn revoke(state: &mut PoolState, grant: Grant) {
        match grant {
            Grant::Connection(conn) => state.unclaim(&conn.id),
            Grant::Slot => state.pending_creates -= 1,
        }
    }

    /// Take back a grant that was sent but never consumed
    fn return_grant(&self, state: &mut PoolState, grant: Grant) {
        Self::revoke(state, grant);
        self.dispatch(state);
    }

    /// Return a connection to the pool
    pub async fn release(&self, connection: &Connection) {
        self.release_leased(connection, Lease::new(self, connection.id)).await;
    }

    /// Release under `lease`, which hands the connection back if this future is dropped
    async fn release_leased(&self, connection: &Connection, lease: Lease<'_>) {
        if self.config.validate_on_release {
            let in_use = self
                .state
                .lock()
                .connections
                .get(&connection.id)
                .is_some_and(|e| e.in_use);
            if !in_use {
                lease.disarm();
                warn!(connection = %connection.id, "release of unknown or idle connection ignored");
                return;
            }
            let valid = self.factory.validate_connection(connection).await;
            lease.disarm();
            if !valid {
                debug!(connection = %connection.id, "released connection failed validation");
                self.stats.record_validation_failure();
                self.discard(connection).await;
                return;
            }
        } else {
            lease.disarm();
        }

        let mut state = self.state.lock();
        match state.connections.get_mut(&connection.id) {
            None => {
                warn!(connection = %connection.id, "release of unknown connection ignored");
                return;
            }
            Some(entry) if !entry.in_use => {
                warn!(connection = %connection.id, "connection released twice");
                return;
            }
            Some(entry) => {
                entry.in_use = false;
                entry.last_used_at = Instant::now();
                entry.use_count += 1;
                entry.connection.touch();
            }
        }
        self.stats.record_release();
        self.dispatch(&mut state);
    }

    /// Synchronous return used when a lease is dropped without `release`
    fn return_unchecked(&self, id: &ConnectionId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.connections.get_mut(id) {
            if entry.in_use {
                entry.in_use = false;
                entry.last_used_at = Instant::now();
                entry.use_count += 1;
                self.stats.record_release();
                self.dispatch(&mut state);
            }
        }
    }

    /// Remove a connection from the pool and destroy it
    async fn discard(&self, connection: &Connection) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.connections.remove(&connection.id).is_some();
            if removed {
                self.dispatch(&mut state);
            }
            removed
        };
        if removed {
            self.destroy_quietly(connection).await;
        }
    }

    async fn destroy_quietly(&self, connection: &Connection) {
        self.stats.record_destroyed();
        if let Err(e) = self.factory.destroy_connection(connection).await {
            debug!(connection = %connection.id, error = %e, "ignoring connection teardown failure");
        }
    }

    /// Evict idle connections older than `idle_timeout`
    pub async fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        if idle_timeout.is_zero() {
            return 0;
        }

        let expired: Vec<Connection> = {
            let mut state = self.state.lock();
            let ids: Vec<ConnectionId> = state
                .connections
                .iter()
                .filter(|(_, e)| !e.in_use && e.last_used_at.elapsed() > idle_timeout)
                .map(|(id, _)| *id)
                .collect();
            let expired = ids
                .iter()
                .filter_map(|id| state.connections.remove(id))
                .map(|e| e.connection)
                .collect();
            self.dispatch(&mut state);
            expired
        };

        for conn in &expired {
            self.stats.record_eviction();
            self.destroy_quietly(conn).await;
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "evicted idle connections");
        }
        expired.len()
    }

    /// Acquire, run `op`, release; the connection goes back even if `op` panics
    pub async fn with_connection<F, Fut, T>(&self, config: &DataSourceConfig, op: F) -> Result<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let connection = self.acquire(config).await?;
        let lease = Lease::new(self, connection.id);
        let result = op(connection.clone()).await;
        self.release_leased(&connection, lease).await;
        result
    }

    /// Run `op` on a pooled connection, retrying retryable failures with backoff
    pub async fn execute_with_retry<F, Fut, T>(&self, config: &DataSourceConfig, op: F) -> Result<T>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.with_connection(config, &op).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            attempt,
                            data_source = %config.id,
                            "pooled operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = policy.delay_for_retry(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        data_source = %config.id,
                        error = %e,
                        "retryable failure, backing off"
                    );
                    self.stats.record_retry();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.with_attempts(attempt)),
            }
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let idle = state.idle_count();
        let total = state.connections.len();
        let s = &self.stats;
        PoolStats {
            total,
            idle,
            in_use: total - idle,
            pending_creates: state.pending_creates,
            waiting: state.waiters.len(),
            max_connections: self.config.max_connections,
            connections_created: s.connections_created.load(Ordering::Relaxed),
            connections_destroyed: s.connections_destroyed.load(Ordering::Relaxed),
            acquisitions: s.acquisitions.load(Ordering::Relaxed),
            releases: s.releases.load(Ordering::Relaxed),
            acquire_timeouts: s.acquire_timeouts.load(Ordering::Relaxed),
            validation_failures: s.validation_failures.load(Ordering::Relaxed),
            idle_evictions: s.idle_evictions.load(Ordering::Relaxed),
            create_failures: s.create_failures.load(Ordering::Relaxed),
            retries: s.retries.load(Ordering::Relaxed),
            total_wait_time_ms: s.total_wait_time_ms.load(Ordering::Relaxed),
        }
    }

    /// Use count and age of a pooled connection
    pub fn connection_usage(&self, id: &ConnectionId) -> Option<(u64, Duration)> {
        self.state
            .lock()
            .connections
            .get(id)
            .map(|e| (e.use_count, e.created_at.elapsed()))
    }

    /// Reject waiters, destroy every connection, stop sweeping
    ///
    /// Safe to call more than once; later calls do nothing.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (waiters, connections) = {
            let mut state = self.state.lock();
            let waiters = std::mem::take(&mut state.waiters);
            let connections: Vec<Connection> = state
                .connections
                .drain()
                .map(|(_, e)| e.connection)
                .collect();
            (waiters, connections)
        };

        let rejected = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(Error::PoolDestroyed));
        }

        let teardown = connections.iter().map(|c| self.destroy_quietly(c));
        futures::future::join_all(teardown).await;

        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }

        info!(
            connections = connections.len(),
            waiters = rejected,
            "connection pool destroyed"
        );
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

/// Releases a reserved creation slot if creation is abandoned
struct SlotGuard<'a> {
    pool: &'a ConnectionPool,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    fn new(pool: &'a ConnectionPool) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state.lock();
            state.pending_creates -= 1;
            self.pool.dispatch(&mut state);
        }
    }
}

/// An idle connection claimed for validation; dropping it puts the connection back unused
struct ClaimGuard<'a> {
    pool: &'a ConnectionPool,
    id: ConnectionId,
    armed: bool,
}

impl<'a> ClaimGuard<'a> {
    fn new(pool: &'a ConnectionPool, id: ConnectionId) -> Self {
        Self {
            pool,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state.lock();
            state.unclaim(&self.id);
            self.pool.dispatch(&mut state);
        }
    }
}

/// A queued acquire; leaving the queue early hands any grant back
struct WaitGuard<'a> {
    pool: &'a ConnectionPool,
    ticket: u64,
    rx: oneshot::Receiver<Result<Grant>>,
    done: bool,
}

impl<'a> WaitGuard<'a> {
    fn new(pool: &'a ConnectionPool, ticket: u64, rx: oneshot::Receiver<Result<Grant>>) -> Self {
        Self {
            pool,
            ticket,
            rx,
            done: false,
        }
    }

    fn complete(&mut self) {
        self.done = true;
    }

    /// Leave the queue; returns a grant that raced with the cancellation
    fn cancel(&mut self) -> Option<Result<Grant>> {
        self.done = true;
        if self.pool.state.lock().waiters.remove(&self.ticket).is_some() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(Ok(grant)) = self.cancel() {
            let mut state = self.pool.state.lock();
            self.pool.return_grant(&mut state, grant);
        }
    }
}

/// Returns a connection synchronously if a release or `with_connection` unwinds or is cancelled
struct Lease<'a> {
    pool: &'a ConnectionPool,
    id: ConnectionId,
    armed: bool,
}

impl<'a> Lease<'a> {
    fn new(pool: &'a ConnectionPool, id: ConnectionId) -> Self {
        Self {
            pool,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.return_unchecked(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.acquire_timeout(), Duration::from_secs(30));
        assert!(config.validate_on_acquire);
        assert!(!config.validate_on_release);
        assert_eq!(config.retry.attempts, 3);
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::default()
            .with_max_connections(2)
            .with_idle_timeout(Duration::from_secs(5))
            .with_acquire_timeout(Duration::from_millis(500))
            .with_validate_on_release(true)
            .with_retry(RetryPolicy::no_retry());

        assert_eq!(config.max_connections, 2);
        assert_eq!(config.idle_timeout_ms, 5_000);
        assert_eq!(config.acquire_timeout_ms, 500);
        assert!(config.validate_on_release);
        assert_eq!(config.retry.attempts, 1);
    }

    #[test]
    fn test_pool_config_validate() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(PoolConfig::default()
            .with_max_connections(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_pool_config_deserialize_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{"max_connections": 3}"#).unwrap();
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.acquire_timeout_ms, 30_000);
        assert!(config.validate_on_acquire);
    }

    #[test]
    fn test_pool_stats_avg_wait() {
        let stats = PoolStats {
            acquisitions: 4,
            total_wait_time_ms: 100,
            ..Default::default()
        };
        assert!((stats.avg_wait_time_ms() - 25.0).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().avg_wait_time_ms(), 0.0);
    }

    #[test]
    fn test_state_claim_prefers_most_recent() {
        let mut state = PoolState::default();
        let older = Connection::new("memory").connected();
        let newer = Connection::new("memory").connected();
        let now = Instant::now();

        state.connections.insert(
            older.id,
            PooledConnection {
                connection: older.clone(),
                in_use: false,
                created_at: now,
                last_used_at: now,
                use_count: 0,
            },
        );
        state.connections.insert(
            newer.id,
            PooledConnection {
                connection: newer.clone(),
                in_use: false,
                created_at: now,
                last_used_at: now + Duration::from_millis(10),
                use_count: 0,
            },
        );

        assert_eq!(state.claim_idle().map(|c| c.id), Some(newer.id));
        assert_eq!(state.claim_idle().map(|c| c.id), Some(older.id));
        assert!(state.claim_idle().is_none());
        assert_eq!(state.idle_count(), 0);

        state.unclaim(&older.id);
        assert_eq!(state.idle_count(), 1);
    }

    #[test]
    fn test_state_capacity_counts_pending() {
        let mut state = PoolState::default();
        assert!(state.has_capacity(1));
        state.pending_creates = 1;
        assert!(!state.has_capacity(1));
    }
}
