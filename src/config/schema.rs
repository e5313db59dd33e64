use std::collections::HashSet;

use serde::Deserialize;

use super::ConfigError;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub schemas: Vec<SchemaConfig>,
    #[serde(default)]
    pub data_nodes: Vec<DataNodeConfig>,
    #[serde(default)]
    pub data_hosts: Vec<DataHostConfig>,
}

// ============================================================================
// System Configuration
// ============================================================================

/// Process-wide settings shared by every connection
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Default charset announced in the handshake
    #[serde(default = "default_charset")]
    pub charset: String,
    /// Front connections idle longer than this are closed (milliseconds)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Time allowed for the login exchange (milliseconds)
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// Largest logical packet accepted from a client
    #[serde(default = "default_max_allowed_packet")]
    pub max_allowed_packet: usize,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default = "default_true")]
    pub use_handshake_v10: bool,
    /// Accept any password for configured users
    #[serde(default)]
    pub free_login: bool,
    #[serde(default = "default_buffer_chunk")]
    pub processor_buffer_chunk: usize,
    #[serde(default = "default_buffer_page_size")]
    pub buffer_page_size: usize,
    #[serde(default = "default_buffer_page_count")]
    pub buffer_page_count: usize,
    #[serde(default = "default_idle_check_period_ms")]
    pub idle_check_period_ms: u64,
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Payloads shorter than this are sent uncompressed inside compressed frames
    #[serde(default = "default_min_compress_length")]
    pub min_compress_length: usize,
    /// Address of the Prometheus endpoint, disabled when absent
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8066
}

fn default_charset() -> String {
    "utf8".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_auth_timeout_ms() -> u64 {
    15_000
}

fn default_max_allowed_packet() -> usize {
    16 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_buffer_chunk() -> usize {
    4096
}

fn default_buffer_page_size() -> usize {
    1024 * 1024
}

fn default_buffer_page_count() -> usize {
    64
}

fn default_idle_check_period_ms() -> u64 {
    1000
}

fn default_heartbeat_period_ms() -> u64 {
    10_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    5000
}

fn default_min_compress_length() -> usize {
    50
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            charset: default_charset(),
            idle_timeout_ms: default_idle_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            max_allowed_packet: default_max_allowed_packet(),
            use_compression: false,
            use_handshake_v10: true,
            free_login: false,
            processor_buffer_chunk: default_buffer_chunk(),
            buffer_page_size: default_buffer_page_size(),
            buffer_page_count: default_buffer_page_count(),
            idle_check_period_ms: default_idle_check_period_ms(),
            heartbeat_period_ms: default_heartbeat_period_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            min_compress_length: default_min_compress_length(),
            metrics_addr: None,
        }
    }
}

// ============================================================================
// Users / Firewall
// ============================================================================

/// A proxy-level user
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub password: String,
    /// Logical schemas this user may use
    #[serde(default)]
    pub schemas: Vec<String>,
    /// Maximum concurrent front connections, 0 means unlimited
    #[serde(default)]
    pub benchmark: usize,
    #[serde(default)]
    pub read_only: bool,
}

/// Host allow-list. An empty list admits every host.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FirewallConfig {
    #[serde(default)]
    pub whitelist: Vec<WhitelistEntry>,
}

/// Users allowed from a host or host mask (`192.168.1.*`, `10.%.%.%`)
#[derive(Debug, Clone, Deserialize)]
pub struct WhitelistEntry {
    pub host: String,
    #[serde(default)]
    pub users: Vec<String>,
}

// ============================================================================
// Schemas / Data Nodes / Data Hosts
// ============================================================================

/// Logical schema exposed to clients
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    pub name: String,
    /// Data node that receives statements for this schema
    pub data_node: String,
}

/// A physical database on a data host
#[derive(Debug, Clone, Deserialize)]
pub struct DataNodeConfig {
    pub name: String,
    pub data_host: String,
    pub database: String,
}

/// How read traffic is spread across hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalanceType {
    #[default]
    Random,
    WeightedRoundRobin,
    LeastActive,
}

/// Which write host receives writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteType {
    #[default]
    WriteOnlyOneNode,
    WriteRandomNode,
}

/// Failover policy between write hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwitchType {
    NotSwitch,
    #[default]
    Auto,
    SyncStatus,
    ClusterStatus,
}

/// A group of backend hosts serving one or more data nodes
#[derive(Debug, Clone, Deserialize)]
pub struct DataHostConfig {
    pub name: String,
    #[serde(default = "default_max_con")]
    pub max_con: usize,
    #[serde(default = "default_min_con")]
    pub min_con: usize,
    /// 0: no read split, 1: read hosts + standby writers, 2: all hosts, 3: read hosts only
    #[serde(default)]
    pub balance: u8,
    #[serde(default)]
    pub balance_type: BalanceType,
    #[serde(default)]
    pub write_type: WriteType,
    #[serde(default)]
    pub switch_type: SwitchType,
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    #[serde(default = "default_heartbeat_sql")]
    pub heartbeat_sql: String,
    pub write_hosts: Vec<DBHostConfig>,
}

fn default_max_con() -> usize {
    100
}

fn default_min_con() -> usize {
    10
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_heartbeat_sql() -> String {
    "select user()".to_string()
}

/// A single backend MySQL server
#[derive(Debug, Clone, Deserialize)]
pub struct DBHostConfig {
    pub host_name: String,
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub check_alive: bool,
    /// Replicas of this write host
    #[serde(default)]
    pub read_hosts: Vec<DBHostConfig>,
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_weight() -> u32 {
    1
}

impl DBHostConfig {
    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl DataHostConfig {
    /// Databases of every data node placed on this host
    pub fn schemas<'a>(&self, data_nodes: &'a [DataNodeConfig]) -> Vec<&'a str> {
        data_nodes
            .iter()
            .filter(|n| n.data_host == self.name)
            .map(|n| n.database.as_str())
            .collect()
    }
}

impl Config {
    /// Check cross references and sizing
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::protocol::charset::index_of(&self.system.charset).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown charset '{}'", self.system.charset))
        })?;

        let mut host_names = HashSet::new();
        for host in &self.data_hosts {
            if host.write_hosts.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "data host '{}' has no write host",
                    host.name
                )));
            }
            if host.min_con > host.max_con {
                return Err(ConfigError::Invalid(format!(
                    "data host '{}': min_con {} exceeds max_con {}",
                    host.name, host.min_con, host.max_con
                )));
            }
            if host.balance > 3 {
                return Err(ConfigError::Invalid(format!(
                    "data host '{}': balance must be 0..=3",
                    host.name
                )));
            }
            host_names.insert(host.name.as_str());
        }

        let mut node_names = HashSet::new();
        for node in &self.data_nodes {
            if !host_names.contains(node.data_host.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "data node '{}' references unknown data host '{}'",
                    node.name, node.data_host
                )));
            }
            node_names.insert(node.name.as_str());
        }

        for schema in &self.schemas {
            if !node_names.contains(schema.data_node.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "schema '{}' references unknown data node '{}'",
                    schema.name, schema.data_node
                )));
            }
        }

        Ok(())
    }

    pub fn data_node(&self, name: &str) -> Option<&DataNodeConfig> {
        self.data_nodes.iter().find(|n| n.name == name)
    }

    pub fn schema(&self, name: &str) -> Option<&SchemaConfig> {
        self.schemas.iter().find(|s| s.name == name)
    }
}
