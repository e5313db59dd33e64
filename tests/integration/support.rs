//! In-process gateway over an in-memory backend

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use athena_gateway::buffer::BufferPool;
use athena_gateway::config::{Config, DBHostConfig};
use athena_gateway::conn::{ConnManager, FrontConnection, FrontContext};
use athena_gateway::executor::{DefaultNodeRouter, NodeExecutor};
use athena_gateway::pool::{ConnError, Connector, DriverConnection, MysqlConnector, PhysicalDbPool};
use athena_gateway::protocol::resultset::{ColumnDefinition, QueryResult};
use athena_gateway::protocol::capabilities::CLIENT_PROTOCOL_41;
use athena_gateway::protocol::{ConfigPrivileges, OkPacket};

pub const HEARTBEAT_SQL: &str = "select user()";

/// Gateway configuration with one schema on one data host (`m0` with replica `s0`)
pub fn gateway_config(balance: u8) -> Config {
    let config = format!(
        r#"
[system]
auth_timeout_ms = 2000

[[users]]
name = "app"
password = "secret"
schemas = ["shop", "audit"]

[[users]]
name = "report"
password = "report"
schemas = ["shop"]
read_only = true

[[users]]
name = "batch"
password = "batch"
schemas = ["shop"]
benchmark = 1

[[schemas]]
name = "shop"
data_node = "dn1"

[[schemas]]
name = "audit"
data_node = "dn2"

[[data_nodes]]
name = "dn1"
data_host = "dh1"
database = "shop_0"

[[data_nodes]]
name = "dn2"
data_host = "dh1"
database = "audit_0"

[[data_hosts]]
name = "dh1"
max_con = 8
min_con = 2
balance = {balance}
heartbeat_sql = "{HEARTBEAT_SQL}"

[[data_hosts.write_hosts]]
host_name = "m0"
host = "10.0.0.1"
user = "root"

[[data_hosts.write_hosts.read_hosts]]
host_name = "s0"
host = "10.0.0.2"
user = "root"
"#
    );
    let config: Config = toml::from_str(&config).expect("valid gateway config");
    config.validate().expect("consistent gateway config");
    config
}

#[derive(Default)]
struct MemoryState {
    /// (host name, statement), heartbeats excluded
    statements: Mutex<Vec<(String, String)>>,
}

/// Backend connector answering from memory.
///
/// Reads return one row naming the host and database that served them,
/// `fail` returns a server error, anything else affects one row.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<MemoryState>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statements(&self) -> Vec<(String, String)> {
        self.state.statements.lock().clone()
    }

    /// Statements seen by `host`, in order
    pub fn statements_on(&self, host: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|(h, _)| h == host)
            .map(|(_, sql)| sql)
            .collect()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        host: &DBHostConfig,
        schema: Option<&str>,
    ) -> Result<Box<dyn DriverConnection>, ConnError> {
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            host: host.host_name.clone(),
            schema: schema.map(str::to_string),
            bytes_read: 0,
        }))
    }
}

struct MemoryConnection {
    state: Arc<MemoryState>,
    host: String,
    schema: Option<String>,
    bytes_read: u64,
}

impl MemoryConnection {
    fn answer(&self, sql: &str) -> Result<QueryResult, ConnError> {
        if sql == HEARTBEAT_SQL {
            return Ok(QueryResult::default());
        }
        self.state
            .statements
            .lock()
            .push((self.host.clone(), sql.to_string()));

        if sql == "fail" {
            return Err(ConnError::Server {
                code: 1146,
                state: "42S02".into(),
                message: "Table 'shop_0.missing' doesn't exist".into(),
            });
        }
        if sql.trim_start().to_ascii_lowercase().starts_with("select") {
            return Ok(QueryResult {
                columns: vec![ColumnDefinition::varchar("host"), ColumnDefinition::varchar("db")],
                rows: vec![vec![Some(self.host.clone()), self.schema.clone()]],
                ..Default::default()
            });
        }
        Ok(QueryResult::affected(1, 0))
    }
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    async fn query(&mut self, sql: &str) -> Result<QueryResult, ConnError> {
        let result = self.answer(sql);
        if let Ok(r) = &result {
            let packets = match r.is_result_set() {
                true => r.encode_result_set(1, 2),
                false => vec![OkPacket::with_affected(r.affected_rows, r.last_insert_id).encode(1, CLIENT_PROTOCOL_41)],
            };
            self.bytes_read += packets.iter().map(|p| p.wire_len() as u64).sum::<u64>();
        }
        result
    }

    async fn change_schema(&mut self, schema: &str) -> Result<(), ConnError> {
        self.schema = Some(schema.to_string());
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), ConnError> {
        Ok(())
    }

    async fn close(&mut self) {}

    fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// A gateway accepting clients on a loopback port
pub struct Gateway {
    pub addr: SocketAddr,
    pub manager: Arc<ConnManager>,
    pub pool: Arc<PhysicalDbPool>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub async fn start(config: Config, connector: MemoryConnector) -> Gateway {
        let system = config.system.clone();
        let manager = Arc::new(ConnManager::new(Arc::new(
            BufferPool::from_config(&system).expect("valid buffer pool"),
        )));

        let host = config.data_hosts[0].clone();
        let schemas = host
            .schemas(&config.data_nodes)
            .into_iter()
            .map(str::to_string)
            .collect();
        let pool = Arc::new(
            PhysicalDbPool::new(
                host.clone(),
                schemas,
                Arc::new(connector),
                manager.clone(),
                Duration::from_millis(system.idle_timeout_ms),
                Duration::from_millis(system.heartbeat_timeout_ms),
            )
            .expect("valid data host"),
        );
        assert!(pool.init(0).await, "data host should initialize");

        let pools = HashMap::from([(host.name.clone(), pool.clone())]);
        let executor = NodeExecutor::from_config(&config, Arc::new(DefaultNodeRouter::from_config(&config)), &pools)
            .expect("valid data nodes");
        let ctx = FrontContext::new(
            system,
            manager.clone(),
            Arc::new(ConfigPrivileges::from_config(&config)),
            Arc::new(executor),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let shutdown = CancellationToken::new();
        let cancelled = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        let front = FrontConnection::new(ctx.clone(), peer.ip().to_string(), peer.port());
                        tokio::spawn(front.run(stream));
                    }
                }
            }
        });

        Gateway {
            addr,
            manager,
            pool,
            shutdown,
        }
    }

    /// Log in through the gateway's own backend client
    pub async fn connect(
        &self,
        user: &str,
        password: &str,
        schema: Option<&str>,
    ) -> Result<Box<dyn DriverConnection>, ConnError> {
        let host: DBHostConfig = toml::from_str(&format!(
            r#"
host_name = "gateway"
host = "{}"
port = {}
user = "{}"
password = "{}"
"#,
            self.addr.ip(),
            self.addr.port(),
            user,
            password
        ))
        .expect("valid client config");
        MysqlConnector::default().connect(&host, schema).await
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.manager.close_fronts();
    }
}

/// Wait until `check` holds, polling for up to a second
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
