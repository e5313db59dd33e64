use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ExecError, QueryHandler, RouteTarget, Router};
use crate::config::{Config, ConfigError};
use crate::conn::{BindError, FrontConnection};
use crate::pool::PhysicalDbPool;
use crate::protocol::resultset::QueryResult;
use crate::protocol::SessionStatement;

/// Where a data node lives
#[derive(Debug, Clone)]
pub struct NodeTarget {
    pub pool: Arc<PhysicalDbPool>,
    pub database: String,
}

/// Executes each statement on the backend of its data node.
///
/// In autocommit mode the backend goes back to its pool after every
/// statement. Inside a transaction it stays bound to the client until
/// `COMMIT`, `ROLLBACK` or `SET autocommit=1`.
pub struct NodeExecutor {
    router: Arc<dyn Router>,
    nodes: HashMap<String, NodeTarget>,
}

impl NodeExecutor {
    pub fn new(router: Arc<dyn Router>, nodes: HashMap<String, NodeTarget>) -> Self {
        Self { router, nodes }
    }

    /// Resolve every data node of `config` to its pool
    pub fn from_config(
        config: &Config,
        router: Arc<dyn Router>,
        pools: &HashMap<String, Arc<PhysicalDbPool>>,
    ) -> Result<Self, ConfigError> {
        let mut nodes = HashMap::new();
        for node in &config.data_nodes {
            let pool = pools.get(&node.data_host).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "data node '{}' references unknown data host '{}'",
                    node.name, node.data_host
                ))
            })?;
            nodes.insert(
                node.name.clone(),
                NodeTarget {
                    pool: pool.clone(),
                    database: node.database.clone(),
                },
            );
        }
        Ok(Self::new(router, nodes))
    }

    async fn session_statement(
        &self,
        front: &mut FrontConnection,
        statement: SessionStatement,
    ) -> Result<QueryResult, ExecError> {
        match statement {
            SessionStatement::SetAutocommit(false) => front.set_autocommit(false),
            SessionStatement::SetAutocommit(true) => {
                if !front.autocommit() {
                    self.finish(front, "commit").await?;
                }
                front.set_autocommit(true);
            }
            SessionStatement::Begin => {
                // an open transaction is committed implicitly
                if front.in_transaction() {
                    self.finish(front, "commit").await?;
                }
                front.set_in_transaction(true);
            }
            SessionStatement::Commit => {
                front.set_in_transaction(false);
                self.finish(front, "commit").await?;
            }
            SessionStatement::Rollback => {
                front.set_in_transaction(false);
                self.finish(front, "rollback").await?;
            }
        }
        Ok(QueryResult::default())
    }

    /// Run `sql` on every bound backend, then release them all
    async fn finish(&self, front: &mut FrontConnection, sql: &str) -> Result<(), ExecError> {
        let mut first_error = None;
        for node in front.bound_nodes() {
            if let Some(backend) = front.backend_mut(&node) {
                match backend.execute(sql).await {
                    Ok(_) => {
                        if !backend.connection().autocommit {
                            match backend.execute("set autocommit=1").await {
                                Ok(_) => backend.connection_mut().autocommit = true,
                                Err(e) => debug!(backend_id = backend.id(), error = %e, "Restoring autocommit failed"),
                            }
                        }
                    }
                    Err(e) => {
                        warn!(conn_id = front.id(), node = %node, error = %e, sql = %sql, "Transaction end failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
            front.unbind_backend(&node).await;
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Make sure `node` has a bound backend
    async fn bind(&self, front: &mut FrontConnection, node: &str, target: RouteTarget) -> Result<(), ExecError> {
        if front.backend_mut(node).is_some() {
            return Ok(());
        }

        let node_target = self
            .nodes
            .get(node)
            .ok_or_else(|| ExecError::UnknownNode(node.to_string()))?;
        let read = target == RouteTarget::Slave && !front.is_transactional();
        let mut backend = node_target
            .pool
            .get_connection(Some(&node_target.database), read)
            .await?;

        if front.is_transactional() {
            if let Err(e) = backend.execute("set autocommit=0").await {
                backend.release().await;
                return Err(e.into());
            }
            backend.connection_mut().autocommit = false;
        }

        if let Err(BindError::AlreadyBound(backend)) = front.bind_backend(node, backend) {
            backend.release().await;
        }
        Ok(())
    }
}

#[async_trait]
impl QueryHandler for NodeExecutor {
    async fn query(&self, front: &mut FrontConnection, sql: &str) -> Result<QueryResult, ExecError> {
        if let Some(statement) = SessionStatement::parse(sql) {
            return self.session_statement(front, statement).await;
        }

        let route = self.router.route(front.schema(), sql)?;
        if route.target == RouteTarget::Master {
            if let Some(user) = front.user() {
                if front.context().privileges.is_read_only(user) {
                    return Err(ExecError::ReadOnly(user.to_string()));
                }
            }
        }
        self.bind(front, &route.node, route.target).await?;

        let result = match front.backend_mut(&route.node) {
            Some(backend) => backend.execute(sql).await.map_err(ExecError::from),
            None => Err(ExecError::UnknownNode(route.node.clone())),
        };

        let broken = matches!(&result, Err(ExecError::Conn(e)) if e.is_fatal());
        if broken || !front.is_transactional() {
            front.unbind_backend(&route.node).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::buffer::BufferPool;
    use crate::conn::{ConnManager, FrontContext};
    use crate::executor::DefaultNodeRouter;
    use crate::pool::mock::{data_host, MockConnector};
    use crate::protocol::ConfigPrivileges;

    const CONFIG: &str = r#"
[[users]]
name = "app"
schemas = ["shop"]

[[users]]
name = "report"
schemas = ["shop"]
read_only = true

[[schemas]]
name = "shop"
data_node = "dn1"

[[data_nodes]]
name = "dn1"
data_host = "dh1"
database = "shop_0"
"#;

    struct Fixture {
        connector: MockConnector,
        pool: Arc<PhysicalDbPool>,
        front: FrontConnection,
        executor: Arc<NodeExecutor>,
    }

    async fn fixture(balance: u8, init: bool) -> Fixture {
        let config: Config = toml::from_str(CONFIG).unwrap();
        let connector = MockConnector::new();
        let manager = Arc::new(ConnManager::new(Arc::new(BufferPool::new(1024, 64 * 1024, 16).unwrap())));

        let mut dh = data_host(10, 1);
        dh.balance = balance;
        let pool = Arc::new(
            PhysicalDbPool::new(
                dh,
                vec!["shop_0".to_string()],
                Arc::new(connector.clone()),
                manager.clone(),
                Duration::from_secs(60),
                Duration::from_millis(500),
            )
            .unwrap(),
        );
        if init {
            assert!(pool.init(0).await);
        }

        let pools = HashMap::from([("dh1".to_string(), pool.clone())]);
        let executor = Arc::new(
            NodeExecutor::from_config(&config, Arc::new(DefaultNodeRouter::from_config(&config)), &pools).unwrap(),
        );
        let ctx = FrontContext::new(
            config.system.clone(),
            manager,
            Arc::new(ConfigPrivileges::from_config(&config)),
            executor.clone(),
        );
        let mut front = FrontConnection::new(ctx, "127.0.0.1", 40000);
        front.connection_mut().schema = Some("shop".to_string());

        Fixture {
            connector,
            pool,
            front,
            executor,
        }
    }

    #[tokio::test]
    async fn test_autocommit_statement_releases_backend() {
        let mut f = fixture(0, true).await;
        let result = f.executor.query(&mut f.front, "insert into t values (1)").await.unwrap();
        assert_eq!(result.affected_rows, 1);
        assert!(f.front.bound_nodes().is_empty());

        let master = &f.pool.write_sources()[0];
        assert_eq!(master.active_count(), 0);
        assert_eq!(master.idle_count(), 1);
        assert_eq!(f.connector.queries(), vec!["insert into t values (1)".to_string()]);
    }

    #[tokio::test]
    async fn test_transaction_keeps_backend_bound() {
        let mut f = fixture(0, true).await;

        f.executor.query(&mut f.front, "begin").await.unwrap();
        assert!(f.front.in_transaction());
        f.executor.query(&mut f.front, "insert into t values (1)").await.unwrap();
        f.executor.query(&mut f.front, "select * from t").await.unwrap();
        assert_eq!(f.front.bound_nodes(), vec!["dn1".to_string()]);

        f.executor.query(&mut f.front, "commit").await.unwrap();
        assert!(!f.front.in_transaction());
        assert!(f.front.bound_nodes().is_empty());
        assert_eq!(
            f.connector.queries(),
            vec![
                "set autocommit=0".to_string(),
                "insert into t values (1)".to_string(),
                "select * from t".to_string(),
                "commit".to_string(),
                "set autocommit=1".to_string(),
            ]
        );
        // restored to autocommit, so it went back to the pool
        assert_eq!(f.pool.write_sources()[0].idle_count(), 1);
    }

    #[tokio::test]
    async fn test_autocommit_off_and_rollback() {
        let mut f = fixture(0, true).await;

        f.executor.query(&mut f.front, "SET autocommit = 0").await.unwrap();
        assert!(!f.front.autocommit());
        f.executor.query(&mut f.front, "delete from t").await.unwrap();
        assert_eq!(f.front.bound_nodes().len(), 1);

        f.executor.query(&mut f.front, "rollback").await.unwrap();
        assert!(f.front.bound_nodes().is_empty());
        assert!(f.connector.queries().contains(&"rollback".to_string()));

        // still outside autocommit: the next statement binds again
        f.executor.query(&mut f.front, "delete from t").await.unwrap();
        assert_eq!(f.front.bound_nodes().len(), 1);

        f.executor.query(&mut f.front, "set autocommit=1").await.unwrap();
        assert!(f.front.autocommit());
        assert!(f.front.bound_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_broken_backend_is_unbound() {
        let mut f = fixture(0, true).await;
        f.executor.query(&mut f.front, "begin").await.unwrap();
        let err = f.executor.query(&mut f.front, "broken").await.unwrap_err();
        assert_eq!(err.error_code(), 1158);
        assert!(f.front.bound_nodes().is_empty());
        assert_eq!(f.pool.write_sources()[0].active_count(), 0);
    }

    #[tokio::test]
    async fn test_server_error_keeps_transaction() {
        let mut f = fixture(0, true).await;
        f.connector.fail_sql("insert into missing values (1)");
        f.executor.query(&mut f.front, "begin").await.unwrap();
        let err = f
            .executor
            .query(&mut f.front, "insert into missing values (1)")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), 1064);
        assert_eq!(f.front.bound_nodes().len(), 1);
        f.executor.query(&mut f.front, "rollback").await.unwrap();
    }

    #[tokio::test]
    async fn test_uninitialized_pool() {
        let mut f = fixture(0, false).await;
        let err = f.executor.query(&mut f.front, "select 1").await.unwrap_err();
        assert_eq!(err.error_code(), 1218);
    }

    #[tokio::test]
    async fn test_no_schema() {
        let mut f = fixture(0, true).await;
        f.front.connection_mut().schema = None;
        let err = f.executor.query(&mut f.front, "select 1").await.unwrap_err();
        assert!(matches!(err, ExecError::NoDatabase));
    }

    #[tokio::test]
    async fn test_read_only_user() {
        let mut f = fixture(0, true).await;
        f.front.set_user("report");
        let err = f.executor.query(&mut f.front, "delete from t").await.unwrap_err();
        assert_eq!(err.error_code(), 1290);
        f.executor.query(&mut f.front, "select * from t").await.unwrap();
        assert!(f.connector.queries().iter().all(|q| q != "delete from t"));
    }

    #[tokio::test]
    async fn test_reads_go_to_replica() {
        let mut f = fixture(3, true).await;
        let replica = f.pool.read_sources(0)[0].clone();
        replica.heartbeat().start();
        assert!(replica.heartbeat().heartbeat().await);

        f.executor.query(&mut f.front, "select * from t").await.unwrap();
        assert_eq!(replica.total_count(), 1);

        // writes and transactional reads stay on the writer
        f.executor.query(&mut f.front, "begin").await.unwrap();
        f.executor.query(&mut f.front, "select * from t").await.unwrap();
        f.executor.query(&mut f.front, "commit").await.unwrap();
        assert_eq!(replica.total_count(), 1);
    }
}
