use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{ConnError, Connector, DriverConnection};
use crate::config::{DBHostConfig, DataHostConfig};
use crate::conn::{BackConnection, ConnManager, Connection, ConnectionKind};
use crate::heartbeat::{DbHeartbeat, HeartbeatStatus};
use crate::metrics::metrics;

/// Connection pool for one backend host
pub struct PhysicalDataSource {
    name: String,
    size: usize,
    db_config: DBHostConfig,
    dh_config: DataHostConfig,
    read_node: bool,
    connector: Arc<dyn Connector>,
    manager: Arc<ConnManager>,
    idle_timeout: Duration,
    idle: Mutex<VecDeque<BackConnection>>,
    /// Open connections, idle and borrowed
    total: AtomicUsize,
    /// Borrowed connections
    active: AtomicUsize,
    heartbeat: DbHeartbeat,
}

impl PhysicalDataSource {
    pub fn new(
        db_config: DBHostConfig,
        dh_config: DataHostConfig,
        read_node: bool,
        connector: Arc<dyn Connector>,
        manager: Arc<ConnManager>,
        idle_timeout: Duration,
        heartbeat_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let heartbeat = DbHeartbeat::new(
                weak.clone(),
                dh_config.heartbeat_sql.clone(),
                dh_config.max_retry_count,
                heartbeat_timeout,
            );
            Self {
                name: db_config.host_name.clone(),
                size: dh_config.max_con,
                db_config,
                dh_config,
                read_node,
                connector,
                manager,
                idle_timeout,
                idle: Mutex::new(VecDeque::new()),
                total: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                heartbeat,
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of open connections
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn db_config(&self) -> &DBHostConfig {
        &self.db_config
    }

    pub fn dh_config(&self) -> &DataHostConfig {
        &self.dh_config
    }

    pub fn is_read_node(&self) -> bool {
        self.read_node
    }

    pub fn heartbeat(&self) -> &DbHeartbeat {
        &self.heartbeat
    }

    /// Last heartbeat succeeded
    pub fn is_alive(&self) -> bool {
        self.heartbeat.status() == HeartbeatStatus::Ok
    }

    pub fn weight(&self) -> u32 {
        self.db_config.weight
    }

    pub fn total_count(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Reserve a connection slot without exceeding `size`
    fn reserve_slot(&self) -> bool {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.size).then_some(n + 1))
            .is_ok()
    }

    fn borrow(&self, conn: &mut BackConnection) {
        conn.set_borrowed(true);
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        metrics().set_pool_active(&self.name, active);
    }

    fn unborrow(&self) {
        let active = self.active.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        metrics().set_pool_active(&self.name, active);
    }

    /// Open a new pooled connection, returned already borrowed
    pub async fn create_new_connection(
        self: &Arc<Self>,
        schema: Option<&str>,
    ) -> Result<BackConnection, ConnError> {
        if !self.reserve_slot() {
            return Err(ConnError::Exhausted(self.name.clone()));
        }

        let opened = async {
            let driver = self.connector.connect(&self.db_config, schema).await?;
            let mut conn = Connection::new(
                ConnectionKind::Back,
                self.db_config.host.clone(),
                self.db_config.port,
                self.idle_timeout,
            );
            conn.schema = schema.map(str::to_string);
            if let Err(e) = conn.attach(self.manager.clone()).await {
                let mut driver = driver;
                driver.close().await;
                return Err(ConnError::from(e));
            }
            Ok(BackConnection::new(
                conn,
                Arc::downgrade(self),
                driver,
                self.db_config.check_alive,
            ))
        };

        match opened.await {
            Ok(mut conn) => {
                self.borrow(&mut conn);
                debug!(datasource = %self.name, conn_id = conn.id(), schema = ?schema, "Backend connection opened");
                Ok(conn)
            }
            Err(e) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    /// Borrow a connection, preferring an idle one already on `schema`
    pub async fn get_connection(self: &Arc<Self>, schema: Option<&str>) -> Result<BackConnection, ConnError> {
        loop {
            let candidate = {
                let mut idle = self.idle.lock();
                let pos = schema
                    .and_then(|s| idle.iter().position(|c| c.schema() == Some(s)))
                    .unwrap_or(0);
                idle.remove(pos)
            };

            let Some(mut conn) = candidate else {
                return self.create_new_connection(schema).await;
            };

            if conn.is_expired() {
                conn.close("expired in pool").await;
                continue;
            }

            if let Some(schema) = schema {
                if let Err(e) = conn.sync_schema(schema).await {
                    debug!(datasource = %self.name, error = %e, "Schema switch failed");
                    conn.close("schema switch failed").await;
                    if e.is_fatal() {
                        continue;
                    }
                    return Err(e);
                }
            }

            self.borrow(&mut conn);
            return Ok(conn);
        }
    }

    /// Take back a borrowed connection
    pub async fn release(&self, mut conn: BackConnection) {
        if conn.is_borrowed() {
            conn.set_borrowed(false);
            self.unborrow();
        }

        if !conn.is_pooled() || conn.is_expired() || !conn.connection().autocommit {
            conn.close("not reusable").await;
            return;
        }

        self.idle.lock().push_back(conn);
    }

    /// Close a driver connection on behalf of a closing `BackConnection`
    pub async fn close_driver(&self, driver: Option<Box<dyn DriverConnection>>, borrowed: bool) {
        if let Some(mut driver) = driver {
            driver.close().await;
        }
        self.discard(borrowed);
    }

    /// Forget a connection that is gone
    pub(crate) fn discard(&self, borrowed: bool) {
        if borrowed {
            self.unborrow();
        }
        self.total.fetch_sub(1, Ordering::AcqRel);
    }

    /// Open a connection outside the pool, for probing
    pub async fn open_probe(&self) -> Result<Box<dyn DriverConnection>, ConnError> {
        self.connector.connect(&self.db_config, None).await
    }

    /// Close idle connections that are expired. Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        let expired: Vec<BackConnection> = {
            let mut idle = self.idle.lock();
            let (expired, keep): (Vec<_>, Vec<_>) = idle.drain(..).partition(|c| c.is_expired());
            idle.extend(keep);
            expired
        };

        let count = expired.len();
        for conn in expired {
            conn.close("idle timeout").await;
        }
        if count > 0 {
            debug!(datasource = %self.name, count, "Reaped idle backend connections");
        }
        count
    }

    /// Close every idle connection
    pub async fn clear(&self) {
        let drained: Vec<BackConnection> = self.idle.lock().drain(..).collect();
        let count = drained.len();
        for conn in drained {
            conn.close("pool cleared").await;
        }
        info!(datasource = %self.name, count, "Data source cleared");
    }
}

impl std::fmt::Debug for PhysicalDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDataSource")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("read_node", &self.read_node)
            .field("total", &self.total_count())
            .field("active", &self.active_count())
            .finish()
    }
}
