//! Integration tests against a live SQL Server.
//!
//! Set TEST_MSSQL_HOST and TEST_MSSQL_PASSWORD to run these tests;
//! TEST_MSSQL_PORT, TEST_MSSQL_USER, and TEST_MSSQL_DATABASE are
//! optional overrides. Without the required variables every test
//! skips, so the suite stays green on machines with no server.

use mssql_mcp_server::config::Config;
use mssql_mcp_server::db::{MssqlFactory, MssqlPool, QueryExecutor, SqlPool, catalog};
use mssql_mcp_server::error::DbError;
use mssql_mcp_server::models::query::QueryRequest;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Connection settings from TEST_MSSQL_* variables, or None to skip.
fn live_config() -> Option<Config> {
    let host = std::env::var("TEST_MSSQL_HOST").ok()?;
    let password = std::env::var("TEST_MSSQL_PASSWORD").ok()?;
    let mut config = Config {
        host,
        password,
        trust_server_certificate: true,
        min_pool_size: 0,
        max_pool_size: 2,
        ..Config::default_config()
    };
    if let Ok(port) = std::env::var("TEST_MSSQL_PORT") {
        config.port = port.parse().expect("TEST_MSSQL_PORT must be a port number");
    }
    if let Ok(user) = std::env::var("TEST_MSSQL_USER") {
        config.user = user;
    }
    if let Ok(database) = std::env::var("TEST_MSSQL_DATABASE") {
        config.database = database;
    }
    Some(config)
}

fn pool_for(config: &Config) -> Arc<MssqlPool> {
    SqlPool::new(
        config.pool_settings(),
        MssqlFactory::new(config.connect_options()),
    )
}

/// Round-trips a literal SELECT through a pooled connection, including
/// a non-ASCII string column.
#[tokio::test]
async fn test_live_select_round_trip() {
    let Some(config) = live_config() else {
        eprintln!("Skipping test: TEST_MSSQL_HOST / TEST_MSSQL_PASSWORD not set");
        return;
    };
    let pool = pool_for(&config);
    let executor = QueryExecutor::with_default_timeout(Duration::from_secs(30));

    let mut lease = pool.acquire().await.unwrap();
    let request = QueryRequest::new("SELECT 1 AS one, N'héllo wörld' AS greeting");
    let result = executor.run_query(&mut lease, &request, &[]).await;
    lease.release().await;

    let result = result.unwrap();
    assert_eq!(result.columns[0].name, "one");
    assert_eq!(result.columns[1].name, "greeting");
    assert_eq!(result.row_count, 1);
    assert_eq!(result.rows[0][0], json!(1));
    assert_eq!(result.rows[0][1], json!("héllo wörld"));
    assert!(!result.truncated);
}

/// The executor stops reading at max_rows and flags the cut.
#[tokio::test]
async fn test_live_row_cap_truncates_results() {
    let Some(config) = live_config() else {
        eprintln!("Skipping test: TEST_MSSQL_HOST / TEST_MSSQL_PASSWORD not set");
        return;
    };
    let pool = pool_for(&config);
    let executor = QueryExecutor::with_default_timeout(Duration::from_secs(30));

    let mut lease = pool.acquire().await.unwrap();
    let request = QueryRequest::new(
        "SELECT n FROM (VALUES (1),(2),(3),(4),(5),(6),(7),(8),(9),(10)) AS t(n) ORDER BY n",
    )
    .with_max_rows(Some(3));
    let result = executor.run_query(&mut lease, &request, &[]).await;
    lease.release().await;

    let result = result.unwrap();
    assert_eq!(result.rows.len(), 3);
    assert_eq!(result.row_count, 3);
    assert!(result.truncated);
    assert_eq!(result.rows[0][0], json!(1));
}

/// A statement that overruns its budget fails with Timeout and poisons
/// the lease, so the half-read session never returns to the pool.
#[tokio::test]
async fn test_live_timeout_poisons_lease() {
    let Some(config) = live_config() else {
        eprintln!("Skipping test: TEST_MSSQL_HOST / TEST_MSSQL_PASSWORD not set");
        return;
    };
    let pool = pool_for(&config);
    let executor = QueryExecutor::with_default_timeout(Duration::from_secs(30));

    let mut lease = pool.acquire().await.unwrap();
    let request = QueryRequest::new("WAITFOR DELAY '00:00:10'").with_timeout_secs(Some(1));
    let err = executor.run_query(&mut lease, &request, &[]).await.unwrap_err();

    assert!(matches!(err, DbError::Timeout { .. }));
    assert!(err.is_retryable());
    assert!(lease.is_broken());
    lease.release().await;

    let stats = pool.stats().await;
    assert_eq!(stats.available_connections, 0, "poisoned lease must not be re-idled");
}

/// Every server has master; the catalog listing must include it.
#[tokio::test]
async fn test_live_list_databases_contains_master() {
    let Some(config) = live_config() else {
        eprintln!("Skipping test: TEST_MSSQL_HOST / TEST_MSSQL_PASSWORD not set");
        return;
    };
    let pool = pool_for(&config);

    let mut lease = pool.acquire().await.unwrap();
    let databases = catalog::list_databases(&mut lease).await;
    lease.release().await;

    let databases = databases.unwrap();
    assert!(
        databases
            .iter()
            .any(|db| db.name.eq_ignore_ascii_case("master")),
        "master not in {databases:?}"
    );
}

/// Describing a table that does not exist returns a descriptive error
/// instead of an empty shape.
#[tokio::test]
async fn test_live_describe_missing_table_rejected() {
    let Some(config) = live_config() else {
        eprintln!("Skipping test: TEST_MSSQL_HOST / TEST_MSSQL_PASSWORD not set");
        return;
    };
    let pool = pool_for(&config);

    let mut lease = pool.acquire().await.unwrap();
    let err = catalog::describe_table(&mut lease, None, "dbo", "surely_absent_9f2c").await;
    lease.release().await;

    let err = err.unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert!(err.to_string().contains("surely_absent_9f2c"));
}

/// warm_up opens real sessions up to the configured floor and shutdown
/// closes them again.
#[tokio::test]
async fn test_live_warm_up_and_shutdown() {
    let Some(mut config) = live_config() else {
        eprintln!("Skipping test: TEST_MSSQL_HOST / TEST_MSSQL_PASSWORD not set");
        return;
    };
    config.min_pool_size = 1;
    let pool = pool_for(&config);

    pool.warm_up().await.unwrap();
    let stats = pool.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.available_connections, 1);

    pool.shutdown(Duration::from_secs(2)).await;
    assert_eq!(pool.stats().await.total_connections, 0);
}
