//! Circuit breaker for data-source calls
//!
//! Stops calling a failing data source for a cooldown period after repeated
//! failures, then probes it before letting traffic back in.
//!
//! # States
//!
//! - **Closed**: calls pass through; failures inside the monitoring window are counted
//! - **Open**: calls fail immediately with [`Error::CircuitOpen`] until the cooldown elapses
//! - **Half-Open**: a bounded number of probe calls decide whether to close or reopen
//!
//! The open → half-open edge is taken lazily by the first call after the
//! cooldown; no timer runs in the background. Each reopen from half-open grows
//! the cooldown by `backoff_multiplier`, up to `max_backoff_ms`.
//!
//! # Example
//!
//! ```rust,ignore
//! use sift_access::prelude::*;
//!
//! let breaker = CircuitBreaker::new(
//!     "products",
//!     CircuitBreakerConfig::default()
//!         .with_failure_threshold(3)
//!         .with_base_backoff(Duration::from_secs(10)),
//! );
//!
//! let hits = breaker
//!     .execute(|| async { adapter.query(&conn, &query).await })
//!     .await?;
//! ```

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retry::ExponentialBackoff;

/// Outcomes kept for the failure-rate calculation
const MAX_RECENT_OUTCOMES: usize = 1024;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Tripped, calls fail immediately
    Open,
    /// Probing whether the data source has recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitoring window that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successful probes needed to close from half-open
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Window for counting failures and computing the failure rate
    #[serde(default = "default_monitoring_window_ms")]
    pub monitoring_window_ms: u64,
    /// Cooldown after the first trip
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Cooldown growth factor on each reopen
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Cooldown cap
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Concurrent probes admitted while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    /// Per-call timeout (0 = none)
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Transitions kept for diagnostics
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_monitoring_window_ms() -> u64 {
    60_000
}

fn default_base_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_history_limit() -> usize {
    50
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            monitoring_window_ms: default_monitoring_window_ms(),
            base_backoff_ms: default_base_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            half_open_max_calls: default_half_open_max_calls(),
            call_timeout_ms: default_call_timeout_ms(),
            history_limit: default_history_limit(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold for closing from half-open
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the failure counting window
    pub fn with_monitoring_window(mut self, window: Duration) -> Self {
        self.monitoring_window_ms = window.as_millis() as u64;
        self
    }

    /// Set the cooldown after the first trip
    pub fn with_base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the cooldown growth factor
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the cooldown cap
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the number of concurrent half-open probes
    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    /// Set the per-call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the transition history size
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Monitoring window as a duration
    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }

    /// Per-call timeout as a duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Reject configurations the breaker cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::validation(
                "circuit breaker failure_threshold must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(Error::validation(
                "circuit breaker success_threshold must be at least 1",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::validation(
                "circuit breaker backoff_multiplier must be a finite number >= 1.0",
            ));
        }
        Ok(())
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_backoff_ms),
            self.backoff_multiplier,
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// Why the transition happened
    pub reason: String,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// Snapshot of a breaker's health
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Breaker name (usually the data source id)
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Failures counted toward the threshold
    pub failure_count: u32,
    /// Successful probes since entering half-open
    pub success_count: u32,
    /// Calls that reached the wrapped operation
    pub total_calls: u64,
    /// Successful calls
    pub total_successes: u64,
    /// Failed calls, timeouts included
    pub total_failures: u64,
    /// Calls short-circuited without running
    pub rejected_calls: u64,
    /// Calls that exceeded the call timeout
    pub timeouts: u64,
    /// Failure ratio over the monitoring window (0.0 - 1.0)
    pub failure_rate: f64,
    /// Time until the next call is admitted, while open
    pub time_until_retry_ms: Option<u64>,
    /// Cooldown applied on the next trip
    pub current_backoff_ms: u64,
    /// Most recent transitions, oldest first
    pub transitions: Vec<StateTransition>,
}

/// How a call got through the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe { generation: u64 },
}

struct BreakerState {
    state: CircuitState,
    /// Bumped on every transition so late results from an older state are ignored
    generation: u64,
    failures: VecDeque<Instant>,
    probe_successes: u32,
    probes_in_flight: u32,
    backoff: ExponentialBackoff,
    next_retry_at: Option<Instant>,
    outcomes: VecDeque<(Instant, bool)>,
    history: VecDeque<StateTransition>,
    last_activity: Instant,
}

#[derive(Debug, Default)]
struct BreakerCounters {
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    rejected_calls: AtomicU64,
    timeouts: AtomicU64,
}

/// Circuit breaker guarding one data source
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    counters: BreakerCounters,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                failures: VecDeque::new(),
                probe_successes: 0,
                probes_in_flight: 0,
                backoff: config.backoff(),
                next_retry_at: None,
                outcomes: VecDeque::new(),
                history: VecDeque::new(),
                last_activity: now,
            }),
            config,
            counters: BreakerCounters::default(),
        }
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without triggering the lazy open → half-open edge
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures currently counted toward the threshold
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures.len() as u32
    }

    /// Time since the breaker last admitted or rejected a call
    pub fn idle_for(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }

    /// Run `f` through the breaker
    ///
    /// Fails fast with [`Error::CircuitOpen`] while open or when half-open
    /// probes are saturated. A call that exceeds `call_timeout_ms` counts as a
    /// failure and returns [`Error::OperationTimeout`].
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let mut probe = ProbeGuard::new(self, admission);
        self.counters.total_calls.fetch_add(1, Ordering::Relaxed);

        let timeout = self.config.call_timeout();
        let outcome = if timeout.is_zero() {
            f().await
        } else {
            match tokio::time::timeout(timeout, f()).await {
                Ok(result) => result,
                Err(_) => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    Err(Error::operation_timeout(
                        format!("{} call", self.name),
                        timeout,
                    ))
                }
            }
        };

        probe.complete();
        match &outcome {
            Ok(_) => self.on_success(admission),
            Err(e) => self.on_failure(admission, e),
        }
        outcome
    }

    fn admit(&self) -> Result<Admission> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.last_activity = now;

        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                if let Some(retry_at) = inner.next_retry_at.filter(|t| now < *t) {
                    self.counters.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::CircuitOpen {
                        service: self.name.clone(),
                        retry_after: retry_at - now,
                        failure_count: inner.failures.len() as u32,
                    });
                }
                self.transition(&mut inner, CircuitState::HalfOpen, "cooldown elapsed");
                inner.probes_in_flight = 1;
                Ok(Admission::Probe {
                    generation: inner.generation,
                })
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight >= self.config.half_open_max_calls.max(1) {
                    self.counters.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::CircuitOpen {
                        service: self.name.clone(),
                        retry_after: Duration::ZERO,
                        failure_count: inner.failures.len() as u32,
                    });
                }
                inner.probes_in_flight += 1;
                Ok(Admission::Probe {
                    generation: inner.generation,
                })
            }
        }
    }

    /// Record a success observed outside `execute`
    pub fn record_success(&self) {
        self.on_success(self.current_admission());
    }

    /// Record a failure observed outside `execute`
    pub fn record_failure(&self) {
        let admission = self.current_admission();
        self.on_failure(admission, &Error::internal("failure recorded externally"));
    }

    fn current_admission(&self) -> Admission {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => Admission::Probe {
                generation: inner.generation,
            },
            _ => Admission::Normal,
        }
    }

    fn on_success(&self, admission: Admission) {
        self.counters.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.push_outcome(&mut inner, now, true);

        match (inner.state, admission) {
            (CircuitState::Closed, _) => inner.failures.clear(),
            (CircuitState::HalfOpen, Admission::Probe { generation })
                if generation == inner.generation =>
            {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.success_threshold {
                    inner.failures.clear();
                    inner.backoff.reset();
                    self.transition(&mut inner, CircuitState::Closed, "probe calls succeeded");
                }
            }
            // result of a call admitted under an earlier state
            _ => {}
        }
    }

    fn on_failure(&self, admission: Admission, error: &Error) {
        self.counters.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.push_outcome(&mut inner, now, false);

        match (inner.state, admission) {
            (CircuitState::Closed, _) => {
                inner.failures.push_back(now);
                self.prune_failures(&mut inner, now);
                let count = inner.failures.len() as u32;
                debug!(breaker = %self.name, failures = count, error = %error, "call failed");
                if count >= self.config.failure_threshold {
                    let reason = format!("{} failures within monitoring window", count);
                    self.open(&mut inner, now, &reason);
                }
            }
            (CircuitState::HalfOpen, Admission::Probe { generation })
                if generation == inner.generation =>
            {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.backoff.grow();
                self.open(&mut inner, now, "probe call failed");
            }
            _ => {}
        }
    }

    fn prune_failures(&self, inner: &mut BreakerState, now: Instant) {
        let window = self.config.monitoring_window();
        while let Some(first) = inner.failures.front() {
            if now.duration_since(*first) > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn push_outcome(&self, inner: &mut BreakerState, now: Instant, success: bool) {
        inner.outcomes.push_back((now, success));
        while inner.outcomes.len() > MAX_RECENT_OUTCOMES {
            inner.outcomes.pop_front();
        }
    }

    fn open(&self, inner: &mut BreakerState, now: Instant, reason: &str) {
        let cooldown = inner.backoff.current();
        inner.next_retry_at = Some(now + cooldown);
        self.transition(inner, CircuitState::Open, reason);
        warn!(
            breaker = %self.name,
            cooldown_ms = cooldown.as_millis() as u64,
            failures = inner.failures.len(),
            reason,
            "circuit opened"
        );
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, reason: &str) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.generation += 1;
        inner.probe_successes = 0;
        inner.probes_in_flight = 0;
        if to != CircuitState::Open {
            inner.next_retry_at = None;
        }

        inner.history.push_back(StateTransition {
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        while inner.history.len() > self.config.history_limit {
            inner.history.pop_front();
        }

        match to {
            CircuitState::Closed => info!(breaker = %self.name, %from, reason, "circuit closed"),
            CircuitState::HalfOpen => debug!(breaker = %self.name, reason, "circuit half-open"),
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed and forget failures and backoff growth
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failures.clear();
        inner.backoff.reset();
        self.transition(&mut inner, CircuitState::Closed, "manual reset");
    }

    /// Force the breaker open for the current cooldown
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            self.open(&mut inner, Instant::now(), "manual trip");
        }
    }

    /// Snapshot of counters, rate and history
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        let now = Instant::now();
        let window = self.config.monitoring_window();

        let (failed, seen) = inner
            .outcomes
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= window)
            .fold((0u64, 0u64), |(failed, seen), (_, ok)| {
                (failed + u64::from(!ok), seen + 1)
            });
        let failure_rate = if seen == 0 {
            0.0
        } else {
            failed as f64 / seen as f64
        };

        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            success_count: inner.probe_successes,
            total_calls: self.counters.total_calls.load(Ordering::Relaxed),
            total_successes: self.counters.total_successes.load(Ordering::Relaxed),
            total_failures: self.counters.total_failures.load(Ordering::Relaxed),
            rejected_calls: self.counters.rejected_calls.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            failure_rate,
            time_until_retry_ms: inner
                .next_retry_at
                .map(|t| t.saturating_duration_since(now).as_millis() as u64),
            current_backoff_ms: inner.backoff.current().as_millis() as u64,
            transitions: inner.history.iter().cloned().collect(),
        }
    }
}

/// Frees a half-open probe slot if the call is dropped before finishing
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    done: bool,
}

impl<'a> ProbeGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, admission: Admission) -> Self {
        Self {
            breaker,
            admission,
            done: false,
        }
    }

    fn complete(&mut self) {
        self.done = true;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Admission::Probe { generation } = self.admission {
            let mut inner = self.breaker.inner.lock();
            if inner.generation == generation {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            }
        }
    }
}

/// Per-service breakers, created on first use
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: RwLock<HashMap<String, CircuitBreakerConfig>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers use `default_config`
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            overrides: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Use `config` for `service`; an existing breaker is replaced
    pub fn configure(&self, service: impl Into<String>, config: CircuitBreakerConfig) {
        let service = service.into();
        self.breakers.write().remove(&service);
        self.overrides.write().insert(service, config);
    }

    /// Get the breaker for `service`, creating it if needed
    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(service) {
            return breaker.clone();
        }

        let config = self
            .overrides
            .read()
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone());

        self.breakers
            .write()
            .entry(service.to_string())
            .or_insert_with(|| {
                debug!(breaker = service, "creating circuit breaker");
                Arc::new(CircuitBreaker::new(service, config))
            })
            .clone()
    }

    /// Get the breaker for `service`, creating it with `config` if needed
    pub fn get_or_create_with(
        &self,
        service: &str,
        config: &CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(service) {
            return breaker.clone();
        }

        self.breakers
            .write()
            .entry(service.to_string())
            .or_insert_with(|| {
                debug!(breaker = service, "creating circuit breaker with override");
                Arc::new(CircuitBreaker::new(service, config.clone()))
            })
            .clone()
    }

    /// Get an existing breaker
    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(service).cloned()
    }

    /// Run `f` through the breaker for `service`
    pub async fn execute<F, Fut, T>(&self, service: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.get_or_create(service);
        breaker.execute(f).await
    }

    /// Metrics for every breaker, sorted by name
    pub fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let mut metrics: Vec<_> = self.breakers.read().values().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Force every breaker closed
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    /// Drop closed breakers with no counted failures that sat idle longer than `max_idle`
    pub fn remove_stale(&self, max_idle: Duration) -> usize {
        let mut breakers = self.breakers.write();
        let before = breakers.len();
        breakers.retain(|_, b| {
            b.state() != CircuitState::Closed || b.failure_count() > 0 || b.idle_for() <= max_idle
        });
        let removed = before - breakers.len();
        if removed > 0 {
            debug!(removed, "removed stale circuit breakers");
        }
        removed
    }

    /// Number of live breakers
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Whether no breaker has been created yet
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}
