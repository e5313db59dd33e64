//! End-to-end tests against an in-process gateway
//!
//! The client side is the gateway's own `MysqlConnector`, so these cover the
//! handshake and command exchange in both directions over TCP.

use athena_gateway::pool::ConnError;

use crate::support::{eventually, gateway_config, Gateway, MemoryConnector};

fn server_code(err: &ConnError) -> Option<u16> {
    match err {
        ConnError::Server { code, .. } => Some(*code),
        _ => None,
    }
}

#[tokio::test]
async fn test_select_through_gateway() {
    let connector = MemoryConnector::new();
    let gateway = Gateway::start(gateway_config(0), connector.clone()).await;

    let mut client = gateway.connect("app", "secret", Some("shop")).await.unwrap();
    let result = client.query("select * from orders").await.unwrap();
    assert_eq!(result.columns.len(), 2);
    assert_eq!(
        result.rows,
        vec![vec![Some("m0".to_string()), Some("shop_0".to_string())]]
    );
    assert_eq!(gateway.manager.front_count(), 1);
    assert_eq!(gateway.manager.user_connections("app"), 1);

    client.ping().await.unwrap();
    client.close().await;
    assert!(eventually(|| gateway.manager.front_count() == 0).await);
    assert_eq!(gateway.manager.user_connections("app"), 0);
    assert!(gateway.manager.commands().query() >= 1);
    assert!(gateway.manager.commands().ping() >= 1);
}

#[tokio::test]
async fn test_change_schema_routes_to_other_node() {
    let connector = MemoryConnector::new();
    let gateway = Gateway::start(gateway_config(0), connector.clone()).await;

    let mut client = gateway.connect("app", "secret", Some("shop")).await.unwrap();
    client.change_schema("audit").await.unwrap();
    let result = client.query("select * from events").await.unwrap();
    assert_eq!(result.rows[0][1].as_deref(), Some("audit_0"));

    let err = client.change_schema("missing").await.unwrap_err();
    assert_eq!(server_code(&err), Some(1049));
}

#[tokio::test]
async fn test_statement_without_schema() {
    let gateway = Gateway::start(gateway_config(0), MemoryConnector::new()).await;

    let mut client = gateway.connect("app", "secret", None).await.unwrap();
    let err = client.query("select 1").await.unwrap_err();
    assert_eq!(server_code(&err), Some(1046));
}

#[tokio::test]
async fn test_transaction_stays_on_one_backend() {
    let connector = MemoryConnector::new();
    let gateway = Gateway::start(gateway_config(0), connector.clone()).await;

    let mut client = gateway.connect("app", "secret", Some("shop")).await.unwrap();
    client.query("BEGIN").await.unwrap();
    client.query("insert into orders values (1)").await.unwrap();
    assert_eq!(gateway.pool.write_sources()[0].active_count(), 1);
    client.query("COMMIT").await.unwrap();
    assert_eq!(gateway.pool.write_sources()[0].active_count(), 0);

    assert_eq!(
        connector.statements_on("m0"),
        vec![
            "set autocommit=0".to_string(),
            "insert into orders values (1)".to_string(),
            "commit".to_string(),
            "set autocommit=1".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_disconnect_rolls_back_open_transaction() {
    let connector = MemoryConnector::new();
    let gateway = Gateway::start(gateway_config(0), connector.clone()).await;

    let mut client = gateway.connect("app", "secret", Some("shop")).await.unwrap();
    client.query("set autocommit = 0").await.unwrap();
    client.query("delete from orders").await.unwrap();
    client.close().await;

    let master = gateway.pool.write_sources()[0].clone();
    assert!(eventually(|| master.active_count() == 0).await);
    assert_eq!(connector.statements_on("m0").last().map(String::as_str), Some("rollback"));
}

#[tokio::test]
async fn test_backend_error_is_forwarded() {
    let gateway = Gateway::start(gateway_config(0), MemoryConnector::new()).await;

    let mut client = gateway.connect("app", "secret", Some("shop")).await.unwrap();
    let err = client.query("fail").await.unwrap_err();
    assert_eq!(server_code(&err), Some(1146));

    // the session survives
    client.ping().await.unwrap();
    client.query("select 1").await.unwrap();
}

#[tokio::test]
async fn test_login_rejections() {
    let gateway = Gateway::start(gateway_config(0), MemoryConnector::new()).await;

    let err = gateway.connect("app", "wrong", Some("shop")).await.unwrap_err();
    assert!(matches!(&err, ConnError::Auth(msg) if msg.contains("Access denied")), "{err:?}");

    let err = gateway.connect("nobody", "secret", None).await.unwrap_err();
    assert!(matches!(err, ConnError::Auth(_)));

    let err = gateway.connect("app", "secret", Some("nope")).await.unwrap_err();
    assert!(matches!(&err, ConnError::Auth(msg) if msg.contains("Unknown database")), "{err:?}");

    let err = gateway.connect("report", "report", Some("audit")).await.unwrap_err();
    assert!(matches!(&err, ConnError::Auth(msg) if msg.contains("to database 'audit'")), "{err:?}");

    assert!(eventually(|| gateway.manager.front_count() == 0).await);
}

#[tokio::test]
async fn test_user_connection_limit() {
    let gateway = Gateway::start(gateway_config(0), MemoryConnector::new()).await;

    let mut first = gateway.connect("batch", "batch", Some("shop")).await.unwrap();
    let err = gateway.connect("batch", "batch", Some("shop")).await.unwrap_err();
    assert!(matches!(&err, ConnError::Auth(msg) if msg.contains("max_user_connections")), "{err:?}");

    first.close().await;
    assert!(eventually(|| gateway.manager.user_connections("batch") == 0).await);
    gateway.connect("batch", "batch", Some("shop")).await.unwrap();
}

#[tokio::test]
async fn test_read_only_user() {
    let connector = MemoryConnector::new();
    let gateway = Gateway::start(gateway_config(0), connector.clone()).await;

    let mut client = gateway.connect("report", "report", Some("shop")).await.unwrap();
    let err = client.query("update orders set amount = 0").await.unwrap_err();
    assert_eq!(server_code(&err), Some(1290));
    client.query("select * from orders").await.unwrap();

    assert!(connector
        .statements()
        .iter()
        .all(|(_, sql)| !sql.starts_with("update")));
}

#[tokio::test]
async fn test_reads_split_to_replica() {
    let connector = MemoryConnector::new();
    let gateway = Gateway::start(gateway_config(3), connector.clone()).await;

    let replica = gateway.pool.read_sources(0)[0].clone();
    assert!(replica.heartbeat().start());
    assert!(replica.heartbeat().heartbeat().await);

    let mut client = gateway.connect("app", "secret", Some("shop")).await.unwrap();
    let result = client.query("select * from orders").await.unwrap();
    assert_eq!(result.rows[0][0].as_deref(), Some("s0"));

    client.query("insert into orders values (2)").await.unwrap();
    assert_eq!(connector.statements_on("m0"), vec!["insert into orders values (2)".to_string()]);
    assert_eq!(connector.statements_on("s0"), vec!["select * from orders".to_string()]);
}
