mod balance;
mod datasource;
mod dbpool;
mod driver;
#[cfg(test)]
pub(crate) mod mock;

pub use balance::{LeastActive, LoadBalance, RandomBalance, WeightedRoundRobin};
pub use datasource::PhysicalDataSource;
pub use dbpool::PhysicalDbPool;
pub use driver::{Connector, DriverConnection, MysqlConnection, MysqlConnector};

use crate::buffer::BufferError;
use crate::protocol::error_code::*;

/// Backend connectivity errors
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Backend error {code} ({state}): {message}")]
    Server {
        code: u16,
        state: String,
        message: String,
    },

    #[error("Backend connection used after it was returned to the pool")]
    NotBorrowed,

    #[error("Data host '{0}' is not initialized")]
    PoolNotInitialized(String),

    #[error("Connection disconnected")]
    Disconnected,

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Data source '{0}' has no free connections")]
    Exhausted(String),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl ConnError {
    /// Nearest MySQL error number, for reporting to clients
    pub fn error_code(&self) -> u16 {
        match self {
            ConnError::Server { code, .. } => *code,
            ConnError::Auth(_) => ER_ACCESS_DENIED_ERROR,
            ConnError::PoolNotInitialized(_) => ER_CONNECT_TO_MASTER,
            ConnError::Exhausted(_) => ER_CON_COUNT_ERROR,
            ConnError::Buffer(_) => ER_OUT_OF_RESOURCES,
            ConnError::Timeout(_) => ER_LOCK_WAIT_TIMEOUT,
            ConnError::Connect(_) | ConnError::Io(_) | ConnError::Disconnected => ER_NET_READ_ERROR,
            ConnError::Protocol(_) | ConnError::NotBorrowed => ER_UNKNOWN_ERROR,
        }
    }

    /// Whether the underlying socket can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnError::Server { .. } | ConnError::NotBorrowed)
    }
}
