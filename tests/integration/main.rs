//! Integration test entry point
//!
//! In-process tests run a gateway on a loopback port over an in-memory
//! backend and always run. Live tests talk to a running gateway and are
//! skipped unless enabled.
//!
//! Run with: ATHENA_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! Environment variables:
//! - ATHENA_RUN_INTEGRATION_TESTS: Set to "1" to enable live tests
//! - ATHENA_TEST_PROXY_HOST: Gateway host (default: 127.0.0.1)
//! - ATHENA_TEST_PROXY_PORT: Gateway port (default: 8066)
//! - ATHENA_TEST_PROXY_USER: Gateway user (default: app_user)
//! - ATHENA_TEST_PROXY_PASS: Gateway password (default: test123)
//! - ATHENA_TEST_PROXY_DB: Logical schema (default: athena_test)

mod gateway;
mod live;
mod support;

use mysql::{Error as MySqlError, OptsBuilder, Pool, PooledConn};
use std::env;

/// Check if live integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("ATHENA_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if integration tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!("Skipping integration test (set ATHENA_RUN_INTEGRATION_TESTS=1 to run)");
            return;
        }
    };
}

/// Get gateway connection config from environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("ATHENA_TEST_PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("ATHENA_TEST_PROXY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8066),
        user: env::var("ATHENA_TEST_PROXY_USER").unwrap_or_else(|_| "app_user".to_string()),
        password: env::var("ATHENA_TEST_PROXY_PASS").unwrap_or_else(|_| "test123".to_string()),
        database: env::var("ATHENA_TEST_PROXY_DB").unwrap_or_else(|_| "athena_test".to_string()),
    }
}

/// Gateway test configuration
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ProxyTestConfig {
    fn opts(&self) -> OptsBuilder {
        OptsBuilder::new()
            .ip_or_hostname(Some(&self.host))
            .tcp_port(self.port)
            .user(Some(&self.user))
            .pass(Some(&self.password))
            .db_name(Some(&self.database))
    }

    /// Create a connection pool to the gateway
    pub fn pool(&self) -> Pool {
        Pool::new(self.opts()).expect("Failed to create connection pool")
    }

    /// Get a single connection to the gateway
    pub fn conn(&self) -> PooledConn {
        self.pool().get_conn().expect("Failed to get connection")
    }

    /// Try to open a plain connection with a different password or database
    pub fn try_conn(&self, password: &str, database: &str) -> Result<mysql::Conn, MySqlError> {
        mysql::Conn::new(self.opts().pass(Some(password)).db_name(Some(database)))
    }
}

/// Assert that a result is a MySQL error with given code and message
pub fn assert_query_error<T: std::fmt::Debug>(
    result: Result<T, MySqlError>,
    expected_code: u16,
    expected_msg: &str,
) {
    match result {
        Ok(v) => panic!(
            "Expected MySQL error {} with message containing '{}', but got: {:?}",
            expected_code, expected_msg, v
        ),
        Err(MySqlError::MySqlError(ref e)) => {
            assert_eq!(
                e.code, expected_code,
                "Expected error code {}, got {}. Message: {}",
                expected_code, e.code, e.message
            );
            assert!(
                e.message.contains(expected_msg),
                "Expected message containing '{}', got: {}",
                expected_msg,
                e.message
            );
        }
        Err(e) => panic!(
            "Expected MySQL error {} with message containing '{}', got different error: {:?}",
            expected_code, expected_msg, e
        ),
    }
}
