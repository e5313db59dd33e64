//! Statement execution behind the front connection
//!
//! A `Router` names the data node for a statement, `NodeExecutor` runs it on
//! a backend bound to the client for as long as the session needs it.

mod node;

pub use node::{NodeExecutor, NodeTarget};

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::Config;
use crate::conn::FrontConnection;
use crate::pool::ConnError;
use crate::protocol::error_code::*;
use crate::protocol::resultset::QueryResult;

/// Errors reported to the client for one statement
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("No database selected")]
    NoDatabase,

    #[error("Unknown database '{0}'")]
    UnknownSchema(String),

    #[error("Data node '{0}' is not configured")]
    UnknownNode(String),

    #[error("User '{0}' is read only")]
    ReadOnly(String),

    #[error(transparent)]
    Conn(#[from] ConnError),
}

impl ExecError {
    pub fn error_code(&self) -> u16 {
        match self {
            ExecError::NoDatabase => ER_NO_DB_ERROR,
            ExecError::UnknownSchema(_) => ER_BAD_DB_ERROR,
            ExecError::UnknownNode(_) => ER_UNKNOWN_ERROR,
            ExecError::ReadOnly(_) => ER_OPTION_PREVENTS_STATEMENT,
            ExecError::Conn(e) => e.error_code(),
        }
    }
}

/// Runs `COM_QUERY` statements for a front connection
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn query(&self, front: &mut FrontConnection, sql: &str) -> Result<QueryResult, ExecError>;
}

/// Whether a statement may go to a read source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Master,
    Slave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub node: String,
    pub target: RouteTarget,
}

/// Picks the data node for a statement
pub trait Router: Send + Sync {
    fn route(&self, schema: Option<&str>, sql: &str) -> Result<Route, ExecError>;
}

/// Sends every statement of a schema to the schema's data node
#[derive(Debug, Clone, Default)]
pub struct DefaultNodeRouter {
    nodes: HashMap<String, String>,
}

impl DefaultNodeRouter {
    pub fn new(nodes: HashMap<String, String>) -> Self {
        Self { nodes }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .schemas
                .iter()
                .map(|s| (s.name.clone(), s.data_node.clone()))
                .collect(),
        )
    }
}

impl Router for DefaultNodeRouter {
    fn route(&self, schema: Option<&str>, sql: &str) -> Result<Route, ExecError> {
        let schema = schema.ok_or(ExecError::NoDatabase)?;
        let node = self
            .nodes
            .get(schema)
            .ok_or_else(|| ExecError::UnknownSchema(schema.to_string()))?;
        let target = if is_read_statement(sql) {
            RouteTarget::Slave
        } else {
            RouteTarget::Master
        };
        Ok(Route {
            node: node.clone(),
            target,
        })
    }
}

/// Plain reads that a replica can answer
pub fn is_read_statement(sql: &str) -> bool {
    let sql = sql.trim_start().to_ascii_lowercase();
    let first = sql.split_whitespace().next().unwrap_or("");
    match first {
        "select" => !sql.contains(" for update") && !sql.contains(" lock in share mode"),
        "show" | "desc" | "describe" | "explain" => true,
        _ => false,
    }
}
