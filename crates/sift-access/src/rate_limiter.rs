//! Hybrid rate limiting for search clients
//!
//! Each `(client, data source)` pair is checked against two limits:
//! - **Sliding window**: at most `requests_per_window` requests in the trailing
//!   `window_size_ms`
//! - **Token bucket**: up to `burst_capacity` tokens, refilled continuously at
//!   `refill_rate` tokens per second, one token per admitted request
//!
//! With `use_sliding_window` both checks must pass and the more restrictive
//! numbers are reported; otherwise the token bucket decides alone. Only an
//! admitted request records a window timestamp and spends a token.
//!
//! The limiter fails open: if the effective rule is unusable the request is
//! allowed and a warning is logged.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::connection::SearchQuery;
use crate::error::{Error, Result};

/// Limits applied to one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Requests allowed in the sliding window
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    /// Sliding window length
    #[serde(default = "default_window_size_ms")]
    pub window_size_ms: u64,
    /// Token bucket capacity
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: u32,
    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    /// Combine the sliding window with the token bucket
    #[serde(default = "default_true")]
    pub use_sliding_window: bool,
}

fn default_requests_per_window() -> u32 {
    100
}

fn default_window_size_ms() -> u64 {
    60_000
}

fn default_burst_capacity() -> u32 {
    20
}

fn default_refill_rate() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_size_ms: default_window_size_ms(),
            burst_capacity: default_burst_capacity(),
            refill_rate: default_refill_rate(),
            use_sliding_window: true,
        }
    }
}

impl RateLimitRule {
    /// Rule with the given window quota
    pub fn new(requests_per_window: u32, window: Duration) -> Self {
        Self {
            requests_per_window,
            window_size_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            ..Default::default()
        }
    }

    /// Set the token bucket
    pub fn with_bucket(mut self, burst_capacity: u32, refill_rate: f64) -> Self {
        self.burst_capacity = burst_capacity;
        self.refill_rate = refill_rate;
        self
    }

    /// Enable/disable the sliding window check
    pub fn with_sliding_window(mut self, enabled: bool) -> Self {
        self.use_sliding_window = enabled;
        self
    }

    /// Window length as a duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_size_ms)
    }

    /// Reject rules the limiter cannot evaluate
    pub fn validate(&self) -> Result<()> {
        if self.burst_capacity == 0 {
            return Err(Error::validation("rate limit burst_capacity must be at least 1"));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(Error::validation(
                "rate limit refill_rate must be a positive number",
            ));
        }
        if self.use_sliding_window && (self.window_size_ms == 0 || self.requests_per_window == 0)
        {
            return Err(Error::validation(
                "sliding window needs a non-zero window_size_ms and requests_per_window",
            ));
        }
        Ok(())
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Disable to admit everything
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Rule used when no per-data-source override matches
    #[serde(default)]
    pub default: RateLimitRule,
    /// Overrides keyed by data source type
    #[serde(default)]
    pub per_data_source: HashMap<String, RateLimitRule>,
    /// How often `start_cleanup` sweeps stale clients
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: RateLimitRule::default(),
            per_data_source: HashMap::new(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl RateLimiterConfig {
    /// A configuration that admits everything
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the default rule
    pub fn with_default_rule(mut self, rule: RateLimitRule) -> Self {
        self.default = rule;
        self
    }

    /// Override the rule for one data source type
    pub fn with_data_source_rule(
        mut self,
        data_source: impl Into<String>,
        rule: RateLimitRule,
    ) -> Self {
        self.per_data_source.insert(data_source.into(), rule);
        self
    }

    /// Set the cleanup interval
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Effective rule for a data source
    pub fn rule_for(&self, data_source: Option<&str>) -> &RateLimitRule {
        data_source
            .and_then(|ds| self.per_data_source.get(ds))
            .unwrap_or(&self.default)
    }
}

/// Which check shaped a decision
///
/// Informational only; when both checks deny, the sliding window is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedLimit {
    /// No limit applied (limiter disabled or failed open)
    None,
    /// Sliding window
    SlidingWindow,
    /// Token bucket
    TokenBucket,
}

impl fmt::Display for AppliedLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppliedLimit::None => write!(f, "none"),
            AppliedLimit::SlidingWindow => write!(f, "sliding_window"),
            AppliedLimit::TokenBucket => write!(f, "token_bucket"),
        }
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left before the next denial
    pub remaining_requests: u32,
    /// Time until the limits are fully replenished
    pub reset_after: Duration,
    /// When denied, how long to wait before retrying
    pub retry_after: Option<Duration>,
    /// The check that shaped this decision
    pub applied_limit: AppliedLimit,
}

impl RateLimitDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining_requests: u32::MAX,
            reset_after: Duration::ZERO,
            retry_after: None,
            applied_limit: AppliedLimit::None,
        }
    }

    /// Turn a denial into [`Error::RateLimited`]
    pub fn into_result(self, client_id: &str) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(Error::RateLimited {
                client_id: client_id.to_string(),
                retry_after: self.retry_after.unwrap_or_default(),
            })
        }
    }
}

/// Result of one check before combining
struct CheckResult {
    allowed: bool,
    remaining: u32,
    reset_after: Duration,
    retry_after: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RateKey {
    client_id: String,
    data_source: Option<String>,
}

struct ClientRateState {
    window: Duration,
    timestamps: VecDeque<Instant>,
    tokens: f64,
    last_refill: Instant,
    first_request: Instant,
    last_request: Instant,
    total_requests: u64,
    rejected_requests: u64,
}

impl ClientRateState {
    fn new(rule: &RateLimitRule, now: Instant) -> Self {
        Self {
            window: rule.window(),
            timestamps: VecDeque::new(),
            tokens: f64::from(rule.burst_capacity),
            last_refill: now,
            first_request: now,
            last_request: now,
            total_requests: 0,
            rejected_requests: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.timestamps.front() {
            if now.duration_since(*oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn refill(&mut self, rule: &RateLimitRule, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * rule.refill_rate).min(f64::from(rule.burst_capacity));
        self.last_refill = now;
    }

    fn projected_tokens(&self, rule: &RateLimitRule, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * rule.refill_rate).min(f64::from(rule.burst_capacity))
    }

    fn sliding(&self, rule: &RateLimitRule, now: Instant, admitted: bool) -> CheckResult {
        let used = self.timestamps.len() as u32;
        let allowed = used < rule.requests_per_window;
        let until_oldest_expires = self
            .timestamps
            .front()
            .map(|oldest| match oldest.checked_add(self.window) {
                Some(expiry) => expiry.saturating_duration_since(now),
                None => Duration::MAX,
            });

        CheckResult {
            allowed,
            remaining: rule
                .requests_per_window
                .saturating_sub(used + u32::from(admitted)),
            reset_after: if admitted && self.timestamps.is_empty() {
                self.window
            } else {
                until_oldest_expires.unwrap_or_default()
            },
            retry_after: if allowed { None } else { until_oldest_expires },
        }
    }

    fn bucket(&self, rule: &RateLimitRule, admitted: bool) -> CheckResult {
        let allowed = self.tokens >= 1.0;
        let after = if admitted { self.tokens - 1.0 } else { self.tokens };
        let missing = f64::from(rule.burst_capacity) - after;

        CheckResult {
            allowed,
            remaining: after.max(0.0).floor() as u32,
            reset_after: secs_to_duration(missing / rule.refill_rate),
            retry_after: if allowed {
                None
            } else {
                Some(secs_to_duration((1.0 - self.tokens) / rule.refill_rate))
            },
        }
    }
}

/// Seconds as a duration, saturating at `Duration::MAX` for slow refill rates
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// Point-in-time view of one client's limiter state
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRateStats {
    /// Client id
    pub client_id: String,
    /// Data source type the state belongs to
    pub data_source: Option<String>,
    /// Admitted requests still inside the window
    pub requests_in_window: u32,
    /// Tokens available right now
    pub tokens: f64,
    /// Admitted requests since the state was created
    pub total_requests: u64,
    /// Denied requests since the state was created
    pub rejected_requests: u64,
    /// Time since the state was created
    pub since_first_request: Duration,
    /// Time since the last check or recorded request
    pub since_last_request: Duration,
}

/// Limiter-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    /// Distinct `(client, data source)` states tracked
    pub tracked_clients: usize,
    /// Checks performed
    pub checks: u64,
    /// Checks that denied
    pub rejected: u64,
    /// Checks admitted because the rule was unusable
    pub failed_open: u64,
    /// States removed by cleanup
    pub cleaned_up: u64,
}

#[derive(Debug, Default)]
struct LimiterCounters {
    checks: AtomicU64,
    rejected: AtomicU64,
    failed_open: AtomicU64,
    cleaned_up: AtomicU64,
}

/// Per-client hybrid rate limiter
pub struct RateLimiter {
    config: RateLimiterConfig,
    clients: Mutex<HashMap<RateKey, ClientRateState>>,
    counters: LimiterCounters,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.config.enabled)
            .field("tracked_clients", &self.clients.lock().len())
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
            counters: LimiterCounters::default(),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Limiter configuration
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn key(client_id: &str, data_source: Option<&str>) -> RateKey {
        RateKey {
            client_id: client_id.to_string(),
            data_source: data_source.map(str::to_string),
        }
    }

    /// Check and, if allowed, count one request
    pub fn check_limit(
        &self,
        client_id: &str,
        query: &SearchQuery,
        data_source: Option<&str>,
    ) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::unlimited();
        }
        self.counters.checks.fetch_add(1, Ordering::Relaxed);

        let rule = self.config.rule_for(data_source);
        if let Err(e) = rule.validate() {
            self.counters.failed_open.fetch_add(1, Ordering::Relaxed);
            warn!(
                client_id,
                data_source = data_source.unwrap_or("*"),
                error = %e,
                "unusable rate limit rule, allowing request"
            );
            return RateLimitDecision::unlimited();
        }

        trace!(
            client_id,
            data_source = data_source.unwrap_or("*"),
            query_len = query.text.len(),
            "rate limit check"
        );

        let now = Instant::now();
        let mut clients = self.clients.lock();
        let state = clients
            .entry(Self::key(client_id, data_source))
            .or_insert_with(|| ClientRateState::new(rule, now));

        state.prune(now);
        state.refill(rule, now);
        state.last_request = now;

        let token_allows = state.tokens >= 1.0;
        let window_allows = !rule.use_sliding_window
            || (state.timestamps.len() as u32) < rule.requests_per_window;
        let admitted = token_allows && window_allows;

        let bucket = state.bucket(rule, admitted);
        let decision = if rule.use_sliding_window {
            let sliding = state.sliding(rule, now, admitted);
            let applied_limit = if !sliding.allowed {
                AppliedLimit::SlidingWindow
            } else if !bucket.allowed || bucket.remaining < sliding.remaining {
                AppliedLimit::TokenBucket
            } else {
                AppliedLimit::SlidingWindow
            };
            RateLimitDecision {
                allowed: admitted,
                remaining_requests: sliding.remaining.min(bucket.remaining),
                reset_after: sliding.reset_after.max(bucket.reset_after),
                retry_after: match (sliding.retry_after, bucket.retry_after) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                },
                applied_limit,
            }
        } else {
            RateLimitDecision {
                allowed: admitted,
                remaining_requests: bucket.remaining,
                reset_after: bucket.reset_after,
                retry_after: bucket.retry_after,
                applied_limit: AppliedLimit::TokenBucket,
            }
        };

        if admitted {
            state.tokens -= 1.0;
            if rule.use_sliding_window {
                state.timestamps.push_back(now);
            }
            state.total_requests += 1;
        } else {
            state.rejected_requests += 1;
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                client_id,
                data_source = data_source.unwrap_or("*"),
                applied_limit = %decision.applied_limit,
                retry_after_ms = decision.retry_after.unwrap_or_default().as_millis() as u64,
                "request rate limited"
            );
        }

        decision
    }

    /// Count a request that bypassed `check_limit`
    pub fn record_request(&self, client_id: &str, data_source: Option<&str>) {
        if !self.config.enabled {
            return;
        }
        let rule = self.config.rule_for(data_source);
        let now = Instant::now();
        let mut clients = self.clients.lock();
        let state = clients
            .entry(Self::key(client_id, data_source))
            .or_insert_with(|| ClientRateState::new(rule, now));

        state.prune(now);
        state.refill(rule, now);
        state.tokens = (state.tokens - 1.0).max(0.0);
        if rule.use_sliding_window {
            state.timestamps.push_back(now);
        }
        state.last_request = now;
        state.total_requests += 1;
    }

    /// Forget every state belonging to `client_id`
    pub fn reset_client(&self, client_id: &str) -> usize {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|key, _| key.client_id != client_id);
        let removed = before - clients.len();
        if removed > 0 {
            debug!(client_id, removed, "reset rate limit state");
        }
        removed
    }

    /// Remove states idle for more than twice their window
    pub fn cleanup_stale(&self) -> usize {
        let now = Instant::now();
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, state| {
            now.duration_since(state.last_request) <= state.window.saturating_mul(2)
        });
        let removed = before - clients.len();
        if removed > 0 {
            self.counters
                .cleaned_up
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, remaining = clients.len(), "cleaned up stale rate limit state");
        }
        removed
    }

    /// Run `cleanup_stale` every `cleanup_interval_ms` until `shutdown`
    pub fn start_cleanup(self: &Arc<Self>) {
        let mut task = self.cleanup_task.lock();
        if task.is_some() || self.config.cleanup_interval_ms == 0 {
            return;
        }

        let period = Duration::from_millis(self.config.cleanup_interval_ms);
        let weak: Weak<Self> = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                limiter.cleanup_stale();
            }
        }));
    }

    /// Stop the cleanup task
    pub fn shutdown(&self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
            debug!("rate limiter cleanup stopped");
        }
    }

    /// State of one client, if tracked
    pub fn client_stats(
        &self,
        client_id: &str,
        data_source: Option<&str>,
    ) -> Option<ClientRateStats> {
        let rule = self.config.rule_for(data_source);
        let now = Instant::now();
        let clients = self.clients.lock();
        let state = clients.get(&Self::key(client_id, data_source))?;

        let requests_in_window = state
            .timestamps
            .iter()
            .filter(|t| now.duration_since(**t) < state.window)
            .count() as u32;

        Some(ClientRateStats {
            client_id: client_id.to_string(),
            data_source: data_source.map(str::to_string),
            requests_in_window,
            tokens: state.projected_tokens(rule, now),
            total_requests: state.total_requests,
            rejected_requests: state.rejected_requests,
            since_first_request: now.duration_since(state.first_request),
            since_last_request: now.duration_since(state.last_request),
        })
    }

    /// Limiter-wide counters
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            tracked_clients: self.clients.lock().len(),
            checks: self.counters.checks.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            failed_open: self.counters.failed_open.load(Ordering::Relaxed),
            cleaned_up: self.counters.cleaned_up.load(Ordering::Relaxed),
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.get_mut().take() {
            task.abort();
        }
    }
}
