use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use super::Connection;
use crate::pool::{ConnError, DriverConnection, PhysicalDataSource};
use crate::protocol::resultset::QueryResult;

/// A pooled connection to one backend server
pub struct BackConnection {
    conn: Connection,
    pool: Weak<PhysicalDataSource>,
    driver: Option<Box<dyn DriverConnection>>,
    borrowed: bool,
    pooled: bool,
    route_node: Option<String>,
    check_alive: bool,
}

impl BackConnection {
    pub(crate) fn new(
        conn: Connection,
        pool: Weak<PhysicalDataSource>,
        driver: Box<dyn DriverConnection>,
        check_alive: bool,
    ) -> Self {
        Self {
            conn,
            pool,
            driver: Some(driver),
            borrowed: false,
            pooled: true,
            route_node: None,
            check_alive,
        }
    }

    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Owning data source, if still alive
    pub fn pool(&self) -> Option<Arc<PhysicalDataSource>> {
        self.pool.upgrade()
    }

    pub fn is_borrowed(&self) -> bool {
        self.borrowed
    }

    pub(crate) fn set_borrowed(&mut self, borrowed: bool) {
        self.borrowed = borrowed;
    }

    /// Whether this connection goes back to its pool on release
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub fn set_pooled(&mut self, pooled: bool) {
        self.pooled = pooled;
    }

    pub fn route_node(&self) -> Option<&str> {
        self.route_node.as_deref()
    }

    pub(crate) fn set_route_node(&mut self, node: Option<String>) {
        self.route_node = node;
    }

    /// Default database of the underlying session
    pub fn schema(&self) -> Option<&str> {
        self.driver.as_ref().and_then(|d| d.schema())
    }

    /// Closed, or marked for closing by the idle checker
    pub fn is_expired(&self) -> bool {
        self.conn.is_closed() || self.conn.handle().close_requested() || self.driver.is_none()
    }

    fn driver(&mut self) -> Result<&mut Box<dyn DriverConnection>, ConnError> {
        self.driver.as_mut().ok_or(ConnError::Disconnected)
    }

    /// Run a statement. Only allowed while checked out of the pool.
    pub async fn execute(&mut self, sql: &str) -> Result<QueryResult, ConnError> {
        if !self.borrowed {
            return Err(ConnError::NotBorrowed);
        }
        self.conn.handle().record_write(sql.len());
        let before = self.driver()?.bytes_read();
        let result = self.driver()?.query(sql).await;
        if let Some(driver) = self.driver.as_ref() {
            self.conn.handle().record_read(driver.bytes_read().saturating_sub(before) as usize);
        }

        if let Err(e) = &result {
            if e.is_fatal() {
                warn!(conn_id = self.id(), error = %e, "Backend connection broken");
                if let Some(mut driver) = self.driver.take() {
                    driver.close().await;
                }
            }
        }
        result
    }

    /// Switch the backend session to `schema` if it is not there already
    pub async fn sync_schema(&mut self, schema: &str) -> Result<(), ConnError> {
        if self.schema() == Some(schema) {
            return Ok(());
        }
        self.driver()?.change_schema(schema).await?;
        self.conn.schema = Some(schema.to_string());
        Ok(())
    }

    /// Run the heartbeat statement of the owning pool on this connection.
    ///
    /// False on any failure or when liveness checks are disabled.
    pub async fn check_alive(&mut self) -> bool {
        if !self.check_alive {
            return false;
        }
        let sql = match self.pool.upgrade() {
            Some(pool) => pool.dh_config().heartbeat_sql.clone(),
            None => return false,
        };
        if sql.is_empty() {
            return false;
        }
        match self.driver.as_mut() {
            Some(driver) => match driver.query(&sql).await {
                Ok(_) => true,
                Err(e) => {
                    debug!(conn_id = self.id(), error = %e, "Backend liveness check failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Hand the connection back to its pool
    pub async fn release(mut self) {
        self.route_node = None;
        match self.pool.upgrade() {
            Some(pool) => pool.release(self).await,
            None => self.close("released without pool").await,
        }
    }

    /// Roll back if a transaction may be open, then dispose of the driver
    /// connection through the owning pool.
    pub async fn close(mut self, reason: &str) {
        if self.conn.is_closed() {
            return;
        }
        if !self.conn.autocommit {
            if let Some(driver) = self.driver.as_mut() {
                if let Err(e) = driver.query("rollback").await {
                    debug!(conn_id = self.id(), error = %e, "Rollback before close failed");
                }
            }
        }

        let driver = self.driver.take();
        match self.pool.upgrade() {
            Some(pool) => pool.close_driver(driver, self.borrowed).await,
            None => {
                if let Some(mut driver) = driver {
                    driver.close().await;
                }
            }
        }
        self.borrowed = false;
        self.conn.close(reason);
    }
}

impl Drop for BackConnection {
    fn drop(&mut self) {
        // dropped without close: the socket goes with the driver, the slot
        // still has to be returned
        if !self.conn.is_closed() {
            if let Some(pool) = self.pool.upgrade() {
                pool.discard(self.borrowed);
            }
        }
    }
}

impl std::fmt::Debug for BackConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackConnection")
            .field("id", &self.id())
            .field("borrowed", &self.borrowed)
            .field("route_node", &self.route_node)
            .field("schema", &self.schema())
            .finish()
    }
}
