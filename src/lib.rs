//! Connection and protocol core of a MySQL-compatible sharding gateway

pub mod buffer;
pub mod config;
pub mod conn;
pub mod executor;
pub mod heartbeat;
pub mod metrics;
pub mod pool;
pub mod protocol;
