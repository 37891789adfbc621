//! Tests for loading connector configuration

use sift_access::prelude::*;
use std::io::Write;
use std::time::Duration;

const FULL_CONFIG: &str = r#"
pool:
  max_connections: 4
  acquire_timeout_ms: 2000
  retry:
    attempts: 5
    backoff_ms: 50
circuit_breaker:
  failure_threshold: 3
  base_backoff_ms: 1000
rate_limiter:
  default:
    requests_per_window: 50
    window_size_ms: 1000
  per_data_source:
    graphql:
      requests_per_window: 10
      window_size_ms: 1000
      burst_capacity: 5
metrics_capacity: 250
operation_timeout_ms: 5000
data_sources:
  - id: products
    type: graphql
    name: Product catalog
    endpoint: ${SIFT_CONFIG_TEST_PRODUCTS_URL:-https://api.example.com/graphql}
    timeout_ms: 1500
    options:
      api_key: ${SIFT_CONFIG_TEST_API_KEY}
  - id: orders
    type: sql
    endpoint: postgres://db.internal/orders
    pool:
      max_connections: 1
    circuit_breaker: ~
"#;

#[test]
fn test_load_full_config_from_file() {
    std::env::set_var("SIFT_CONFIG_TEST_API_KEY", "s3cr3t");
    std::env::remove_var("SIFT_CONFIG_TEST_PRODUCTS_URL");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FULL_CONFIG.as_bytes()).unwrap();

    let config = ConnectorConfig::from_file(file.path()).unwrap();

    let pool = config.pool.as_ref().unwrap();
    assert_eq!(pool.max_connections, 4);
    assert_eq!(pool.acquire_timeout(), Duration::from_secs(2));
    assert_eq!(pool.retry.attempts, 5);
    assert!(pool.validate_on_acquire);

    assert_eq!(config.circuit_breaker.as_ref().unwrap().failure_threshold, 3);
    assert_eq!(config.metrics_capacity, 250);
    assert_eq!(config.operation_timeout(), Duration::from_secs(5));

    let graphql = config.rate_limiter.rule_for(Some("graphql"));
    assert_eq!(graphql.requests_per_window, 10);
    assert_eq!(graphql.burst_capacity, 5);
    assert_eq!(config.rate_limiter.rule_for(Some("sql")).requests_per_window, 50);

    let products = config.data_source("products").unwrap();
    assert_eq!(products.source_type, SourceType::new("graphql"));
    assert_eq!(
        products.endpoint.as_deref(),
        Some("https://api.example.com/graphql")
    );
    assert_eq!(products.options["api_key"], "s3cr3t");
    assert_eq!(products.timeout_ms, 1_500);

    let orders = config.data_source("orders").unwrap();
    assert_eq!(orders.pool.as_ref().unwrap().max_connections, 1);
    assert!(orders.circuit_breaker.is_none());
}

#[test]
fn test_debug_output_redacts_secrets() {
    std::env::set_var("SIFT_CONFIG_TEST_API_KEY", "s3cr3t");
    let config = ConnectorConfig::from_yaml_str(FULL_CONFIG).unwrap();
    let debug = format!("{:?}", config);
    assert!(!debug.contains("s3cr3t"));
}

#[test]
fn test_missing_file() {
    let err = ConnectorConfig::from_file("/nonexistent/sift.yaml").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_malformed_yaml() {
    let err = ConnectorConfig::from_yaml_str("pool: [not, a, map]").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_invalid_rate_rule_names_data_source() {
    let yaml = r#"
rate_limiter:
  per_data_source:
    graphql:
      burst_capacity: 0
"#;
    let err = ConnectorConfig::from_yaml_str(yaml).unwrap_err();
    assert!(err.to_string().contains("graphql"));
}

#[tokio::test]
async fn test_loaded_config_drives_connector() {
    let yaml = r#"
pool:
  max_connections: 2
data_sources:
  - id: catalog
    type: memory
    endpoint: memory://catalog
"#;
    let config = ConnectorConfig::from_yaml_str(yaml).unwrap();
    let ds = config.data_source("catalog").cloned().unwrap();

    let adapter = sift_access::testing::MockAdapter::new()
        .with_results(vec![SearchResult::new("doc-1", 0.9)]);
    let connector = DataSourceConnector::new(config);
    connector.register_adapter(
        "memory",
        Arc::new(sift_access::testing::MockAdapterFactory::new(adapter)),
    );

    let hits = connector
        .execute_query(&ds, &SearchQuery::new("lamp"), &QueryContext::new())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(connector.connection_pool_stats()["catalog"].max_connections, 2);

    connector.destroy().await;
}
