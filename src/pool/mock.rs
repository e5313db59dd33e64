//! In-memory backend used by unit tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ConnError, Connector, DriverConnection, PhysicalDataSource};
use crate::buffer::BufferPool;
use crate::config::{DBHostConfig, DataHostConfig};
use crate::conn::ConnManager;
use crate::protocol::capabilities::CLIENT_PROTOCOL_41;
use crate::protocol::resultset::{ColumnDefinition, QueryResult};
use crate::protocol::{ErrPacket, OkPacket};

#[derive(Default)]
struct MockState {
    failing: AtomicBool,
    failing_hosts: Mutex<HashSet<String>>,
    failing_sql: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    connect_delay: Mutex<Option<Duration>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

/// Connector whose connections answer from memory
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_host(&self, host_name: &str) {
        self.state.failing_hosts.lock().insert(host_name.to_string());
    }

    pub fn heal_host(&self, host_name: &str) {
        self.state.failing_hosts.lock().remove(host_name);
    }

    pub fn fail_sql(&self, sql: &str) {
        self.state.failing_sql.lock().insert(sql.to_string());
    }

    /// Delay every query by `delay`
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.state.delay.lock() = delay;
    }

    /// Delay every connection attempt by `delay`
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.state.connect_delay.lock() = delay;
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Statements seen so far, heartbeat probes excluded
    pub fn queries(&self) -> Vec<String> {
        self.state.queries.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        host: &DBHostConfig,
        schema: Option<&str>,
    ) -> Result<Box<dyn DriverConnection>, ConnError> {
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.failing.load(Ordering::SeqCst) || self.state.failing_hosts.lock().contains(&host.host_name) {
            return Err(ConnError::Connect(format!("{} refused", host.addr())));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            schema: schema.map(str::to_string),
            user: host.user.clone(),
            bytes_read: 0,
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
    schema: Option<String>,
    user: String,
    bytes_read: u64,
}

impl MockConnection {
    fn answer(&self, sql: &str) -> Result<QueryResult, ConnError> {
        if self.state.failing_sql.lock().contains(sql) {
            return Err(ConnError::Server {
                code: 1064,
                state: "42000".into(),
                message: format!("cannot run '{}'", sql),
            });
        }
        if sql == "broken" {
            return Err(ConnError::Io("connection reset".into()));
        }
        if sql == "select user()" {
            return Ok(QueryResult {
                columns: vec![ColumnDefinition::varchar("user()")],
                rows: vec![vec![Some(self.user.clone())]],
                ..Default::default()
            });
        }
        self.state.queries.lock().push(sql.to_string());
        Ok(QueryResult::affected(1, 0))
    }
}

/// Wire size of the reply a server would send for `result`
pub fn reply_len(result: &Result<QueryResult, ConnError>) -> u64 {
    let packets = match result {
        Ok(r) if r.is_result_set() => r.encode_result_set(1, 2),
        Ok(r) => vec![OkPacket::with_affected(r.affected_rows, r.last_insert_id).encode(1, CLIENT_PROTOCOL_41)],
        Err(ConnError::Server { code, state, message }) => {
            vec![ErrPacket::new(*code, state.as_str(), message.as_str()).encode(1, CLIENT_PROTOCOL_41)]
        }
        Err(_) => Vec::new(),
    };
    packets.iter().map(|p| p.wire_len() as u64).sum()
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn query(&mut self, sql: &str) -> Result<QueryResult, ConnError> {
        let delay = *self.state.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.answer(sql);
        self.bytes_read += reply_len(&result);
        result
    }

    async fn change_schema(&mut self, schema: &str) -> Result<(), ConnError> {
        self.schema = Some(schema.to_string());
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), ConnError> {
        Ok(())
    }

    async fn close(&mut self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Data host with two write hosts (`m0`, `m1`), `m0` having one read host (`s0`)
pub fn data_host(max_con: usize, min_con: usize) -> DataHostConfig {
    let mut config: DataHostConfig = toml::from_str(
        r#"
name = "dh1"
heartbeat_sql = "select user()"
max_retry_count = 1

[[write_hosts]]
host_name = "m0"
host = "10.0.0.1"
user = "root"

[[write_hosts.read_hosts]]
host_name = "s0"
host = "10.0.0.3"
user = "root"

[[write_hosts]]
host_name = "m1"
host = "10.0.0.2"
user = "root"
weight = 2
"#,
    )
    .expect("valid data host");
    config.max_con = max_con;
    config.min_con = min_con;
    config
}

pub fn manager() -> Arc<ConnManager> {
    Arc::new(ConnManager::new(Arc::new(
        BufferPool::new(1024, 64 * 1024, 16).expect("valid buffer pool"),
    )))
}

/// Data source over write host `index` of `config`
pub fn datasource(connector: &MockConnector, config: &DataHostConfig, index: usize) -> Arc<PhysicalDataSource> {
    PhysicalDataSource::new(
        config.write_hosts[index].clone(),
        config.clone(),
        false,
        Arc::new(connector.clone()),
        manager(),
        Duration::from_secs(60),
        Duration::from_millis(500),
    )
}
