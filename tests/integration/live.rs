//! Tests against a running gateway with real backends

use crate::{assert_query_error, get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

const TEST_TABLE: &str = "it_gateway";

fn setup(conn: &mut mysql::PooledConn) {
    conn.query_drop(format!(
        "CREATE TABLE IF NOT EXISTS {} (id INT PRIMARY KEY, name VARCHAR(32))",
        TEST_TABLE
    ))
    .expect("CREATE TABLE should succeed");
    conn.query_drop(format!("DELETE FROM {}", TEST_TABLE))
        .expect("DELETE should succeed");
}

#[test]
fn test_select() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let value: Option<i64> = conn.query_first("SELECT 1").expect("SELECT should succeed");
    assert_eq!(value, Some(1));
}

#[test]
fn test_commit_and_rollback() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    setup(&mut conn);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    conn.query_drop(format!("INSERT INTO {} VALUES (1, 'kept')", TEST_TABLE))
        .expect("INSERT should succeed");
    conn.query_drop("COMMIT").expect("COMMIT should succeed");

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    conn.query_drop(format!("INSERT INTO {} VALUES (2, 'dropped')", TEST_TABLE))
        .expect("INSERT should succeed");
    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");

    let names: Vec<String> = conn
        .query(format!("SELECT name FROM {} ORDER BY id", TEST_TABLE))
        .expect("SELECT should succeed");
    assert_eq!(names, vec!["kept".to_string()]);
}

#[test]
fn test_autocommit_off_is_isolated() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let pool = config.pool();
    let mut writer = pool.get_conn().expect("Failed to get connection");
    let mut reader = pool.get_conn().expect("Failed to get connection");
    setup(&mut writer);

    writer.query_drop("SET autocommit = 0").expect("SET should succeed");
    writer
        .query_drop(format!("INSERT INTO {} VALUES (3, 'pending')", TEST_TABLE))
        .expect("INSERT should succeed");

    let count: Option<i64> = reader
        .query_first(format!("SELECT COUNT(*) FROM {} WHERE id = 3", TEST_TABLE))
        .expect("SELECT should succeed");
    assert_eq!(count, Some(0), "uncommitted row must not be visible");

    writer.query_drop("ROLLBACK").expect("ROLLBACK should succeed");
    writer.query_drop("SET autocommit = 1").expect("SET should succeed");
}

#[test]
fn test_missing_table_error() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let result: Result<Vec<i64>, _> = conn.query("SELECT * FROM it_gateway_missing_table");
    assert_query_error(result, 1146, "doesn't exist");
}

#[test]
fn test_wrong_password() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let result = config.try_conn("definitely-wrong", &config.database);
    assert_query_error(result.map(|_| ()), 1045, "Access denied");
}

#[test]
fn test_unknown_database() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let result = config.try_conn(&config.password, "athena_no_such_schema");
    assert_query_error(result.map(|_| ()), 1049, "Unknown database");
}
