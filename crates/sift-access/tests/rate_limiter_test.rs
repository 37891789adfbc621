//! Tests for sift-access rate limiter module

use sift_access::prelude::*;
use sift_access::rate_limiter::AppliedLimit;
use std::time::Duration;

fn query() -> SearchQuery {
    SearchQuery::new("wireless headphones")
}

/// Five requests per second with a bucket large enough to never bind
fn window_rule() -> RateLimitRule {
    RateLimitRule::new(5, Duration::from_secs(1)).with_bucket(100, 100.0)
}

fn limiter(rule: RateLimitRule) -> RateLimiter {
    RateLimiter::new(RateLimiterConfig::default().with_default_rule(rule))
}

// ==================== Sliding Window Tests ====================

#[tokio::test(start_paused = true)]
async fn test_sixth_request_in_window_is_rejected() {
    let limiter = limiter(window_rule());

    for expected_remaining in (0..5).rev() {
        let decision = limiter.check_limit("web", &query(), None);
        assert!(decision.allowed);
        assert_eq!(decision.remaining_requests, expected_remaining);
    }

    let decision = limiter.check_limit("web", &query(), None);
    assert!(!decision.allowed);
    assert_eq!(decision.applied_limit, AppliedLimit::SlidingWindow);
    let retry_after = decision.retry_after.unwrap();
    assert!(retry_after > Duration::ZERO);
    assert!(retry_after <= Duration::from_secs(1));

    let err = decision.into_result("web").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimit);
    assert!(matches!(err, Error::RateLimited { ref client_id, .. } if client_id == "web"));
}

#[tokio::test(start_paused = true)]
async fn test_window_slides() {
    let limiter = limiter(window_rule());
    for _ in 0..5 {
        assert!(limiter.check_limit("web", &query(), None).allowed);
    }
    assert!(!limiter.check_limit("web", &query(), None).allowed);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(limiter.check_limit("web", &query(), None).allowed);
}

#[tokio::test(start_paused = true)]
async fn test_clients_are_independent() {
    let limiter = limiter(window_rule());
    for _ in 0..5 {
        limiter.check_limit("web", &query(), None);
    }
    assert!(!limiter.check_limit("web", &query(), None).allowed);
    assert!(limiter.check_limit("mobile", &query(), None).allowed);
}

// ==================== Token Bucket Tests ====================

#[tokio::test(start_paused = true)]
async fn test_bucket_refills_over_time() {
    let rule = RateLimitRule::default()
        .with_sliding_window(false)
        .with_bucket(2, 1.0);
    let limiter = limiter(rule);

    assert!(limiter.check_limit("web", &query(), None).allowed);
    assert!(limiter.check_limit("web", &query(), None).allowed);

    let denied = limiter.check_limit("web", &query(), None);
    assert!(!denied.allowed);
    assert_eq!(denied.applied_limit, AppliedLimit::TokenBucket);
    assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(limiter.check_limit("web", &query(), None).allowed);
    assert!(!limiter.check_limit("web", &query(), None).allowed);
}

#[tokio::test(start_paused = true)]
async fn test_denied_requests_do_not_consume_tokens() {
    let rule = RateLimitRule::new(1, Duration::from_secs(10)).with_bucket(5, 1.0);
    let limiter = limiter(rule);

    assert!(limiter.check_limit("web", &query(), None).allowed);
    for _ in 0..3 {
        assert!(!limiter.check_limit("web", &query(), None).allowed);
    }

    let stats = limiter.client_stats("web", None).unwrap();
    assert_eq!(stats.requests_in_window, 1);
    assert!((stats.tokens - 4.0).abs() < 1e-9);
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.rejected_requests, 3);
}

#[tokio::test(start_paused = true)]
async fn test_tighter_limit_wins() {
    let rule = RateLimitRule::new(10, Duration::from_secs(60)).with_bucket(3, 0.5);
    let limiter = limiter(rule);

    let decision = limiter.check_limit("web", &query(), None);
    assert!(decision.allowed);
    assert_eq!(decision.remaining_requests, 2);
    assert_eq!(decision.applied_limit, AppliedLimit::TokenBucket);
}

#[tokio::test(start_paused = true)]
async fn test_very_slow_refill_saturates_wait_times() {
    let rule = RateLimitRule::new(10, Duration::from_secs(1)).with_bucket(1, 1e-20);
    assert!(rule.validate().is_ok());
    let limiter = limiter(rule);

    let first = limiter.check_limit("web", &query(), None);
    assert!(first.allowed);

    let denied = limiter.check_limit("web", &query(), None);
    assert!(!denied.allowed);
    assert_eq!(denied.applied_limit, AppliedLimit::TokenBucket);
    assert_eq!(denied.retry_after, Some(Duration::MAX));
    assert_eq!(limiter.stats().failed_open, 0);
}

#[tokio::test(start_paused = true)]
async fn test_huge_window_does_not_overflow() {
    let rule = RateLimitRule::new(1, Duration::MAX).with_bucket(100, 100.0);
    let limiter = limiter(rule);

    assert!(limiter.check_limit("web", &query(), None).allowed);
    let denied = limiter.check_limit("web", &query(), None);
    assert!(!denied.allowed);
    assert!(denied.retry_after.unwrap() > Duration::from_secs(365 * 24 * 3_600));
    assert_eq!(limiter.cleanup_stale(), 0);
}

// ==================== Configuration Tests ====================

#[tokio::test(start_paused = true)]
async fn test_per_data_source_rule() {
    let config = RateLimiterConfig::default()
        .with_default_rule(window_rule())
        .with_data_source_rule("graphql", RateLimitRule::new(1, Duration::from_secs(1)));
    let limiter = RateLimiter::new(config);

    assert!(limiter.check_limit("web", &query(), Some("graphql")).allowed);
    assert!(!limiter.check_limit("web", &query(), Some("graphql")).allowed);

    // other types fall back to the default rule and keep their own state
    assert!(limiter.check_limit("web", &query(), Some("sql")).allowed);
    assert!(limiter.check_limit("web", &query(), Some("sql")).allowed);
}

#[tokio::test]
async fn test_unusable_rule_fails_open() {
    let broken = RateLimitRule::default().with_bucket(0, 1.0);
    let config = RateLimiterConfig::default().with_data_source_rule("graphql", broken);
    let limiter = RateLimiter::new(config);

    for _ in 0..50 {
        let decision = limiter.check_limit("web", &query(), Some("graphql"));
        assert!(decision.allowed);
        assert_eq!(decision.applied_limit, AppliedLimit::None);
    }

    let stats = limiter.stats();
    assert_eq!(stats.failed_open, 50);
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.tracked_clients, 0);
}

#[tokio::test]
async fn test_disabled_limiter_admits_everything() {
    let limiter = RateLimiter::new(RateLimiterConfig::disabled());
    for _ in 0..1_000 {
        assert!(limiter.check_limit("web", &query(), None).allowed);
    }
    assert_eq!(limiter.stats().checks, 0);
}

// ==================== Maintenance Tests ====================

#[tokio::test(start_paused = true)]
async fn test_cleanup_removes_idle_clients() {
    let limiter = limiter(window_rule());
    limiter.check_limit("web", &query(), None);
    tokio::time::advance(Duration::from_millis(1_500)).await;
    limiter.check_limit("mobile", &query(), None);

    tokio::time::advance(Duration::from_millis(600)).await;
    assert_eq!(limiter.cleanup_stale(), 1);
    assert!(limiter.client_stats("web", None).is_none());
    assert!(limiter.client_stats("mobile", None).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_background_cleanup_task() {
    let config = RateLimiterConfig::default()
        .with_default_rule(window_rule())
        .with_cleanup_interval(Duration::from_millis(100));
    let limiter = Arc::new(RateLimiter::new(config));
    limiter.start_cleanup();

    limiter.check_limit("web", &query(), None);
    tokio::time::sleep(Duration::from_millis(2_200)).await;

    let stats = limiter.stats();
    assert_eq!(stats.tracked_clients, 0);
    assert_eq!(stats.cleaned_up, 1);

    limiter.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_reset_client_and_record_request() {
    let limiter = limiter(window_rule());
    limiter.check_limit("web", &query(), Some("sql"));
    limiter.check_limit("web", &query(), Some("graphql"));
    limiter.check_limit("mobile", &query(), None);

    assert_eq!(limiter.reset_client("web"), 2);
    assert_eq!(limiter.stats().tracked_clients, 1);

    for _ in 0..5 {
        limiter.record_request("batch", None);
    }
    assert!(!limiter.check_limit("batch", &query(), None).allowed);
}
