use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use super::balance::{self, LoadBalance};
use super::{ConnError, Connector, PhysicalDataSource};
use crate::config::{ConfigError, DataHostConfig, SwitchType, WriteType};
use crate::conn::{BackConnection, ConnManager};

/// All backend hosts of one data host: write sources, their replicas and the
/// policy for choosing among them
pub struct PhysicalDbPool {
    host_name: String,
    config: DataHostConfig,
    /// Databases placed on this data host, used round-robin during init
    schemas: Vec<String>,
    write_sources: Vec<Arc<PhysicalDataSource>>,
    /// Read sources keyed by the index of their write source
    read_sources: HashMap<usize, Vec<Arc<PhysicalDataSource>>>,
    load_balance: Box<dyn LoadBalance>,
    active_index: AtomicUsize,
    init_ok: AtomicBool,
}

impl PhysicalDbPool {
    /// Build data sources for every configured write and read host
    pub fn new(
        config: DataHostConfig,
        schemas: Vec<String>,
        connector: Arc<dyn Connector>,
        manager: Arc<ConnManager>,
        idle_timeout: Duration,
        heartbeat_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let mut write_sources = Vec::with_capacity(config.write_hosts.len());
        let mut read_sources = HashMap::new();

        for (idx, host) in config.write_hosts.iter().enumerate() {
            write_sources.push(PhysicalDataSource::new(
                host.clone(),
                config.clone(),
                false,
                connector.clone(),
                manager.clone(),
                idle_timeout,
                heartbeat_timeout,
            ));

            let reads: Vec<_> = host
                .read_hosts
                .iter()
                .map(|read| {
                    PhysicalDataSource::new(
                        read.clone(),
                        config.clone(),
                        true,
                        connector.clone(),
                        manager.clone(),
                        idle_timeout,
                        heartbeat_timeout,
                    )
                })
                .collect();
            if !reads.is_empty() {
                read_sources.insert(idx, reads);
            }
        }

        Self::with_sources(config, schemas, write_sources, read_sources)
    }

    /// Assemble a pool from existing data sources
    pub fn with_sources(
        config: DataHostConfig,
        schemas: Vec<String>,
        write_sources: Vec<Arc<PhysicalDataSource>>,
        read_sources: HashMap<usize, Vec<Arc<PhysicalDataSource>>>,
    ) -> Result<Self, ConfigError> {
        if write_sources.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "data host '{}' has no write host",
                config.name
            )));
        }
        if config.balance > 3 {
            return Err(ConfigError::Invalid(format!(
                "data host '{}' has invalid balance {}",
                config.name, config.balance
            )));
        }

        Ok(Self {
            host_name: config.name.clone(),
            load_balance: balance::for_type(config.balance_type),
            config,
            schemas,
            write_sources,
            read_sources,
            active_index: AtomicUsize::new(0),
            init_ok: AtomicBool::new(false),
        })
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn config(&self) -> &DataHostConfig {
        &self.config
    }

    pub fn write_sources(&self) -> &[Arc<PhysicalDataSource>] {
        &self.write_sources
    }

    pub fn read_sources(&self, write_index: usize) -> &[Arc<PhysicalDataSource>] {
        self.read_sources
            .get(&write_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn switch_type(&self) -> SwitchType {
        self.config.switch_type
    }

    pub fn active_index(&self) -> usize {
        self.active_index.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.init_ok.load(Ordering::Acquire)
    }

    /// Every data source, write sources first
    pub fn all_sources(&self) -> Vec<Arc<PhysicalDataSource>> {
        let mut sources = self.write_sources.clone();
        for idx in 0..self.write_sources.len() {
            sources.extend(self.read_sources(idx).iter().cloned());
        }
        sources
    }

    /// The write source to use now. Never fails.
    pub fn source(&self) -> Arc<PhysicalDataSource> {
        match self.config.write_type {
            WriteType::WriteOnlyOneNode => self.write_sources[self.active_index()].clone(),
            WriteType::WriteRandomNode => {
                let idx = rand::thread_rng().gen_range(0..self.write_sources.len());
                let picked = &self.write_sources[idx];
                if picked.is_alive() {
                    return picked.clone();
                }

                let others: Vec<_> = self
                    .write_sources
                    .iter()
                    .enumerate()
                    .filter(|(i, s)| *i != idx && s.is_alive())
                    .map(|(_, s)| s.clone())
                    .collect();
                if others.is_empty() {
                    return self.write_sources[0].clone();
                }
                others[rand::thread_rng().gen_range(0..others.len())].clone()
            }
        }
    }

    /// The source for a read, according to `balance`
    pub fn read_source(&self) -> Arc<PhysicalDataSource> {
        let active = self.active_index();
        let alive = |s: &&Arc<PhysicalDataSource>| s.is_alive();

        let candidates: Vec<Arc<PhysicalDataSource>> = match self.config.balance {
            // read hosts of the active writer plus standby writers
            1 => self
                .read_sources(active)
                .iter()
                .chain(
                    self.write_sources
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != active)
                        .map(|(_, s)| s),
                )
                .filter(alive)
                .cloned()
                .collect(),
            2 => self.all_sources().iter().filter(alive).cloned().collect(),
            3 => self.read_sources(active).iter().filter(alive).cloned().collect(),
            _ => Vec::new(),
        };

        self.load_balance
            .select(&candidates)
            .unwrap_or_else(|| self.write_sources[active].clone())
    }

    /// Open and release `min_con` connections on write source `index`.
    ///
    /// The pool becomes usable, with `index` active, only if at least one
    /// connection could be opened.
    pub async fn init(&self, index: usize) -> bool {
        if !self.open_min_connections(index).await {
            return false;
        }
        self.active_index.store(index, Ordering::Release);
        self.init_ok.store(true, Ordering::Release);
        true
    }

    /// Open `min_con` connections on write source `index`; true if any opened
    async fn open_min_connections(&self, index: usize) -> bool {
        if index >= self.write_sources.len() {
            warn!(
                datahost = %self.host_name,
                index,
                write_hosts = self.write_sources.len(),
                "Write host index out of range"
            );
            return false;
        }

        let source = &self.write_sources[index];
        let mut opened = 0;
        for i in 0..self.config.min_con {
            let schema = match self.schemas.is_empty() {
                true => None,
                false => Some(self.schemas[i % self.schemas.len()].as_str()),
            };
            match source.create_new_connection(schema).await {
                Ok(conn) => {
                    conn.release().await;
                    opened += 1;
                }
                Err(e) => {
                    warn!(
                        datahost = %self.host_name,
                        datasource = %source.name(),
                        schema = ?schema,
                        error = %e,
                        "Failed to open connection during init"
                    );
                }
            }
        }

        if opened == 0 {
            warn!(datahost = %self.host_name, datasource = %source.name(), "Data host init failed");
            return false;
        }
        info!(
            datahost = %self.host_name,
            datasource = %source.name(),
            connections = opened,
            "Data host initialized"
        );
        true
    }

    /// Make write source `index` active. Succeeds only if it can be initialized.
    ///
    /// The current writer keeps serving until the new one is ready.
    pub async fn switch_source(&self, index: usize, reason: &str) -> bool {
        let previous = self.active_index();
        if index == previous && self.is_initialized() {
            return true;
        }

        if !self.open_min_connections(index).await {
            warn!(datahost = %self.host_name, to = index, reason = %reason, "Write host switch failed");
            return false;
        }

        self.active_index.store(index, Ordering::Release);
        self.init_ok.store(true, Ordering::Release);
        info!(
            datahost = %self.host_name,
            from = previous,
            to = index,
            reason = %reason,
            "Write host switched"
        );
        if let Some(old) = self.write_sources.get(previous).filter(|_| previous != index) {
            old.clear().await;
        }
        true
    }

    fn ensure_initialized(&self) -> Result<(), ConnError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(ConnError::PoolNotInitialized(self.host_name.clone()))
        }
    }

    /// Borrow a connection for a write (or a read when `read` is set)
    pub async fn get_connection(&self, schema: Option<&str>, read: bool) -> Result<BackConnection, ConnError> {
        self.ensure_initialized()?;
        let source = if read { self.read_source() } else { self.source() };
        source.get_connection(schema).await
    }

    pub fn start_heartbeats(&self) {
        for source in self.all_sources() {
            source.heartbeat().start();
        }
    }

    pub fn stop_heartbeats(&self) {
        for source in self.all_sources() {
            source.heartbeat().stop();
        }
    }

    /// Stop heartbeats and close idle connections everywhere
    pub async fn shutdown(&self) {
        self.stop_heartbeats();
        for source in self.all_sources() {
            source.clear().await;
        }
    }
}

impl std::fmt::Debug for PhysicalDbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDbPool")
            .field("host_name", &self.host_name)
            .field("write_sources", &self.write_sources)
            .field("active_index", &self.active_index())
            .field("init_ok", &self.is_initialized())
            .finish()
    }
}
