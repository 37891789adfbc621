//! Tests for sift-access pool module

use parking_lot::Mutex;
use sift_access::prelude::*;
use sift_access::testing::MockAdapter;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

fn pool_with(adapter: &MockAdapter, config: PoolConfig) -> Arc<ConnectionPool> {
    let factory = AdapterConnectionFactory::new(Arc::new(adapter.clone()));
    ConnectionPool::new(config, Arc::new(factory))
}

fn catalog() -> DataSourceConfig {
    DataSourceConfig::new("catalog", "memory")
}

// ==================== Capacity Tests ====================

#[tokio::test(start_paused = true)]
async fn test_pool_never_exceeds_max_connections() {
    let adapter = MockAdapter::new();
    let pool = pool_with(&adapter, PoolConfig::default().with_max_connections(3));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.with_connection(&catalog(), |_conn| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let stats = pool.stats();
    assert!(adapter.max_open_connections() <= 3);
    assert!(stats.connections_created <= 3);
    assert_eq!(stats.acquisitions, 10);
    assert_eq!(stats.releases, 10);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn test_third_acquire_waits_for_release() {
    let adapter = MockAdapter::new();
    let pool = pool_with(&adapter, PoolConfig::default().with_max_connections(2));

    let first = pool.acquire(&catalog()).await.unwrap();
    let _second = pool.acquire(&catalog()).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(&catalog()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.waiting(), 1);
    assert!(!waiter.is_finished());

    pool.release(&first).await;
    let third = waiter.await.unwrap().unwrap();

    assert_eq!(third.id, first.id);
    assert_eq!(pool.stats().connections_created, 2);
    assert_eq!(pool.waiting(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_are_served_in_arrival_order() {
    let adapter = MockAdapter::new();
    let pool = pool_with(&adapter, PoolConfig::default().with_max_connections(1));
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = pool.acquire(&catalog()).await.unwrap();

    let mut tasks = Vec::new();
    for label in ["a", "b", "c"] {
        let pool = pool.clone();
        let order = order.clone();
        tasks.push(tokio::spawn(async move {
            pool.with_connection(&catalog(), |_conn| async move {
                order.lock().push(label);
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(())
            })
            .await
        }));
        // let the task reach the queue before the next one starts
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(pool.waiting(), 3);

    pool.release(&held).await;
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(*order.lock(), vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_timeout_leaves_other_waiters_queued() {
    let adapter = MockAdapter::new();
    let config = PoolConfig::default()
        .with_max_connections(1)
        .with_acquire_timeout(Duration::from_millis(100));
    let pool = pool_with(&adapter, config);

    let held = pool.acquire(&catalog()).await.unwrap();

    let early = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(&catalog()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let late = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(&catalog()).await })
    };

    let err = early.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AcquireTimeout);
    assert_eq!(pool.waiting(), 1);

    pool.release(&held).await;
    let conn = late.await.unwrap().unwrap();
    assert_eq!(conn.id, held.id);

    let stats = pool.stats();
    assert_eq!(stats.acquire_timeouts, 1);
    assert_eq!(stats.waiting, 0);
}

// ==================== Validation Tests ====================

#[tokio::test(start_paused = true)]
async fn test_invalid_idle_connection_is_skipped() {
    let adapter = MockAdapter::new();
    let pool = pool_with(&adapter, PoolConfig::default().with_max_connections(2));

    let a = pool.acquire(&catalog()).await.unwrap();
    let b = pool.acquire(&catalog()).await.unwrap();
    pool.release(&a).await;
    tokio::time::advance(Duration::from_millis(5)).await;
    pool.release(&b).await;

    // b is the most recently used, so it is offered first
    adapter.mark_unhealthy(b.id);
    let conn = pool.acquire(&catalog()).await.unwrap();

    assert_eq!(conn.id, a.id);
    assert_eq!(pool.stats().validation_failures, 1);
    assert_eq!(pool.size(), 1);
    assert_eq!(adapter.disconnected_ids(), vec![b.id]);
}

#[tokio::test(start_paused = true)]
async fn test_validate_on_release_discards_broken_connection() {
    let adapter = MockAdapter::new();
    let config = PoolConfig::default().with_validate_on_release(true);
    let pool = pool_with(&adapter, config);

    let conn = pool.acquire(&catalog()).await.unwrap();
    adapter.mark_unhealthy(conn.id);
    pool.release(&conn).await;

    assert_eq!(pool.size(), 0);
    assert_eq!(adapter.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_idle_validation_returns_connection() {
    let adapter = MockAdapter::new().with_health_check_latency(Duration::from_secs(1));
    let pool = pool_with(&adapter, PoolConfig::default().with_max_connections(1));

    let conn = pool.acquire(&catalog()).await.unwrap();
    pool.release(&conn).await;

    let abandoned = tokio::time::timeout(Duration::from_millis(10), pool.acquire(&catalog())).await;
    assert!(abandoned.is_err());

    let stats = pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.in_use, 0);

    let again = pool.acquire(&catalog()).await.unwrap();
    assert_eq!(again.id, conn.id);
    assert_eq!(pool.stats().validation_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_release_validation_returns_connection() {
    let adapter = MockAdapter::new().with_health_check_latency(Duration::from_secs(1));
    let config = PoolConfig::default()
        .with_max_connections(1)
        .with_validate_on_acquire(false)
        .with_validate_on_release(true);
    let pool = pool_with(&adapter, config);

    let conn = pool.acquire(&catalog()).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(&catalog()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.waiting(), 1);

    let abandoned = tokio::time::timeout(Duration::from_millis(10), pool.release(&conn)).await;
    assert!(abandoned.is_err());

    // the queued acquire gets the connection handed back by the dropped release
    let next = waiter.await.unwrap().unwrap();
    assert_eq!(next.id, conn.id);
    assert_eq!(pool.waiting(), 0);
    assert_eq!(pool.stats().in_use, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_creation_frees_the_slot() {
    let adapter = MockAdapter::new().fail_next_connects(1);
    let pool = pool_with(&adapter, PoolConfig::default().with_max_connections(1));

    let err = pool.acquire(&catalog()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);

    let conn = pool.acquire(&catalog()).await.unwrap();
    assert!(conn.is_connected());

    let stats = pool.stats();
    assert_eq!(stats.create_failures, 1);
    assert_eq!(stats.pending_creates, 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_creation_times_out() {
    let adapter = MockAdapter::new().with_connect_latency(Duration::from_secs(5));
    let config = PoolConfig::default().with_connection_timeout(Duration::from_millis(200));
    let pool = pool_with(&adapter, config);

    let err = pool.acquire(&catalog()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationTimeout);
    assert_eq!(pool.stats().pending_creates, 0);
}

// ==================== Lifecycle Tests ====================

#[tokio::test(start_paused = true)]
async fn test_idle_connections_are_swept() {
    let adapter = MockAdapter::new();
    let config = PoolConfig::default().with_idle_timeout(Duration::from_secs(1));
    let pool = pool_with(&adapter, config);

    let conn = pool.acquire(&catalog()).await.unwrap();
    pool.release(&conn).await;
    assert_eq!(pool.size(), 1);

    tokio::time::sleep(Duration::from_millis(1_600)).await;

    assert_eq!(pool.size(), 0);
    assert_eq!(pool.stats().idle_evictions, 1);
    assert_eq!(adapter.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connection_returned_when_operation_is_cancelled() {
    let adapter = MockAdapter::new();
    let pool = pool_with(&adapter, PoolConfig::default().with_max_connections(1));

    let task = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.with_connection(&catalog(), |_conn| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.stats().in_use, 1);

    task.abort();
    let _ = task.await;

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
    pool.acquire(&catalog()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_destroy_rejects_waiters_and_is_idempotent() {
    let adapter = MockAdapter::new();
    let pool = pool_with(&adapter, PoolConfig::default().with_max_connections(1));

    let _held = pool.acquire(&catalog()).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(&catalog()).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    pool.destroy().await;
    pool.destroy().await;

    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolDestroyed);
    assert!(pool.is_destroyed());
    assert_eq!(pool.size(), 0);
    assert_eq!(adapter.disconnect_count(), 1);

    let err = pool.acquire(&catalog()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolDestroyed);
}

// ==================== Retry Tests ====================

#[tokio::test(start_paused = true)]
async fn test_execute_with_retry_gives_up_after_budget() {
    let adapter = MockAdapter::new();
    let config = PoolConfig::default().with_retry(RetryPolicy::new().with_attempts(3));
    let pool = pool_with(&adapter, config);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let err = pool
        .execute_with_retry(&catalog(), |_conn| {
            let calls = calls.clone();
            async move {
                calls.lock().push(Instant::now());
                Err::<(), _>(Error::query_retryable("backend busy"))
            }
        })
        .await
        .unwrap_err();

    let calls = calls.lock();
    assert_eq!(calls.len(), 3);
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[1] >= gaps[0]);

    assert_eq!(err.kind(), ErrorKind::Query);
    assert!(err.is_retryable());
    assert_eq!(err.context().and_then(|c| c.attempts), Some(3));
    assert_eq!(pool.stats().retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_execute_with_retry_stops_on_fatal_error() {
    let adapter = MockAdapter::new();
    let pool = pool_with(&adapter, PoolConfig::default());
    let attempts = AtomicU32::new(0);

    let err = pool
        .execute_with_retry(&catalog(), |_conn| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::query("syntax error")) }
        })
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(!err.is_retryable());
    assert_eq!(pool.stats().retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_execute_with_retry_recovers() {
    let adapter = MockAdapter::new().with_results(vec![SearchResult::new("1", 0.8)]);
    let pool = pool_with(&adapter, PoolConfig::default());
    adapter.script_query_failures(2, 0);

    let shared = adapter.clone();
    let hits = pool
        .execute_with_retry(&catalog(), |conn| {
            let adapter = shared.clone();
            async move { adapter.query(&conn, &SearchQuery::new("lamp")).await }
        })
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(adapter.query_count(), 3);
    // every attempt reused the same pooled connection
    assert_eq!(adapter.connect_count(), 1);
}

// ==================== Stats Tests ====================

#[tokio::test(start_paused = true)]
async fn test_connection_usage_tracking() {
    let adapter = MockAdapter::new();
    let pool = pool_with(&adapter, PoolConfig::default());

    let conn = pool.acquire(&catalog()).await.unwrap();
    pool.release(&conn).await;
    let again = pool.acquire(&catalog()).await.unwrap();
    pool.release(&again).await;

    let (uses, _age) = pool.connection_usage(&conn.id).unwrap();
    assert_eq!(uses, 2);

    let stats = pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.acquisitions, 2);
    assert_eq!(stats.max_connections, 10);
}
