//! Rolling performance metrics for connector operations
//!
//! Keeps the most recent N [`QueryMetric`]s in a ring and summarizes them on
//! demand:
//! - Totals and success rate
//! - Average, p95 and max latency
//! - Per-source-type breakdown

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default number of retained metrics
pub const DEFAULT_METRICS_CAPACITY: usize = 1_000;

/// One recorded connector operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMetric {
    /// Data source id
    pub data_source: String,
    /// Adapter type
    pub source_type: String,
    /// Operation name (`connect`, `query`, `execute_query`, ...)
    pub operation: String,
    /// Wall time spent
    pub duration_ms: u64,
    /// Whether the operation succeeded
    pub success: bool,
    /// Error code on failure
    pub error_code: Option<String>,
    /// Results returned, for queries
    pub result_count: usize,
    /// When the operation finished
    pub at: DateTime<Utc>,
}

impl QueryMetric {
    /// Create a successful metric
    pub fn success(
        data_source: impl Into<String>,
        source_type: impl Into<String>,
        operation: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            data_source: data_source.into(),
            source_type: source_type.into(),
            operation: operation.into(),
            duration_ms: duration.as_millis() as u64,
            success: true,
            error_code: None,
            result_count: 0,
            at: Utc::now(),
        }
    }

    /// Mark as failed with an error code
    pub fn with_error(mut self, code: impl Into<String>) -> Self {
        self.success = false;
        self.error_code = Some(code.into());
        self
    }

    /// Set the number of results
    pub fn with_result_count(mut self, count: usize) -> Self {
        self.result_count = count;
        self
    }
}

/// Per-source-type figures
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceTypeSummary {
    /// Operations recorded
    pub operations: usize,
    /// Failed operations
    pub failures: usize,
    /// Average latency in milliseconds
    pub avg_latency_ms: f64,
}

/// Summary over the retained metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceSummary {
    /// Operations in the ring
    pub total_operations: usize,
    /// Operations recorded since creation, including evicted ones
    pub total_recorded: u64,
    /// Successful operations in the ring
    pub successes: usize,
    /// Failed operations in the ring
    pub failures: usize,
    /// `successes / total_operations` (1.0 when empty)
    pub success_rate: f64,
    /// Average latency in milliseconds
    pub avg_latency_ms: f64,
    /// 95th percentile latency (nearest rank)
    pub p95_latency_ms: u64,
    /// Slowest operation
    pub max_latency_ms: u64,
    /// Breakdown by adapter type
    pub by_source_type: BTreeMap<String, SourceTypeSummary>,
}

/// Bounded ring of recent operation metrics
#[derive(Debug)]
pub struct PerformanceMetrics {
    capacity: usize,
    entries: Mutex<VecDeque<QueryMetric>>,
    total_recorded: AtomicU64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_CAPACITY)
    }
}

impl PerformanceMetrics {
    /// Create a ring holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_METRICS_CAPACITY))),
            total_recorded: AtomicU64::new(0),
        }
    }

    /// Ring capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a metric, evicting the oldest when full
    pub fn record(&self, metric: QueryMetric) {
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(metric);
        self.total_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of retained metrics
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The `n` most recent metrics, oldest first
    pub fn recent(&self, n: usize) -> Vec<QueryMetric> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Drop every retained metric
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Summarize the retained metrics
    pub fn summary(&self) -> PerformanceSummary {
        let entries = self.entries.lock();
        let total_recorded = self.total_recorded.load(Ordering::Relaxed);
        if entries.is_empty() {
            return PerformanceSummary {
                total_recorded,
                success_rate: 1.0,
                ..Default::default()
            };
        }

        let total = entries.len();
        let successes = entries.iter().filter(|m| m.success).count();

        let mut latencies: Vec<u64> = entries.iter().map(|m| m.duration_ms).collect();
        latencies.sort_unstable();
        let sum: u64 = latencies.iter().sum();
        let rank = ((total as f64) * 0.95).ceil() as usize;
        let p95 = latencies[rank.clamp(1, total) - 1];

        let mut by_type: BTreeMap<String, (usize, usize, u64)> = BTreeMap::new();
        for m in entries.iter() {
            let slot = by_type.entry(m.source_type.clone()).or_default();
            slot.0 += 1;
            slot.1 += usize::from(!m.success);
            slot.2 += m.duration_ms;
        }

        PerformanceSummary {
            total_operations: total,
            total_recorded,
            successes,
            failures: total - successes,
            success_rate: successes as f64 / total as f64,
            avg_latency_ms: sum as f64 / total as f64,
            p95_latency_ms: p95,
            max_latency_ms: latencies[total - 1],
            by_source_type: by_type
                .into_iter()
                .map(|(ty, (ops, failures, sum))| {
                    (
                        ty,
                        SourceTypeSummary {
                            operations: ops,
                            failures,
                            avg_latency_ms: sum as f64 / ops as f64,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(ty: &str, ms: u64) -> QueryMetric {
        QueryMetric::success("ds", ty, "query", Duration::from_millis(ms))
    }

    #[test]
    fn test_empty_summary() {
        let metrics = PerformanceMetrics::default();
        let summary = metrics.summary();
        assert_eq!(summary.total_operations, 0);
        assert_eq!(summary.success_rate, 1.0);
        assert_eq!(metrics.capacity(), DEFAULT_METRICS_CAPACITY);
    }

    #[test]
    fn test_ring_is_bounded() {
        let metrics = PerformanceMetrics::new(3);
        for ms in 1..=5 {
            metrics.record(metric("sql", ms));
        }
        assert_eq!(metrics.len(), 3);

        let kept: Vec<u64> = metrics.recent(10).iter().map(|m| m.duration_ms).collect();
        assert_eq!(kept, vec![3, 4, 5]);
        assert_eq!(metrics.summary().total_recorded, 5);
    }

    #[test]
    fn test_summary_figures() {
        let metrics = PerformanceMetrics::new(100);
        for ms in 1..=20 {
            metrics.record(metric("sql", ms * 10));
        }
        metrics.record(metric("graphql", 50).with_error("QUERY_ERROR"));

        let summary = metrics.summary();
        assert_eq!(summary.total_operations, 21);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.max_latency_ms, 200);
        // nearest rank: ceil(21 * 0.95) = 20th smallest
        assert_eq!(summary.p95_latency_ms, 190);

        let sql = &summary.by_source_type["sql"];
        assert_eq!(sql.operations, 20);
        assert_eq!(sql.failures, 0);
        assert!((sql.avg_latency_ms - 105.0).abs() < f64::EPSILON);
        assert_eq!(summary.by_source_type["graphql"].failures, 1);
    }

    #[test]
    fn test_recent_and_clear() {
        let metrics = PerformanceMetrics::new(10);
        metrics.record(metric("sql", 1).with_result_count(4));
        metrics.record(metric("sql", 2));

        let last = metrics.recent(1);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].duration_ms, 2);
        assert_eq!(metrics.recent(5)[0].result_count, 4);

        metrics.clear();
        assert!(metrics.is_empty());
    }
}
