use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use athena_gateway::buffer::BufferPool;
use athena_gateway::config::{self, Config};
use athena_gateway::conn::{ConnManager, FrontConnection, FrontContext};
use athena_gateway::executor::{DefaultNodeRouter, NodeExecutor};
use athena_gateway::heartbeat::HeartbeatScheduler;
use athena_gateway::metrics::start_metrics_server;
use athena_gateway::pool::{Connector, MysqlConnector, PhysicalDbPool};
use athena_gateway::protocol::{charset, ConfigPrivileges};

const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = load_or_default_config()?;
    let system = config.system.clone();

    let buffer_pool = Arc::new(BufferPool::from_config(&system).context("invalid buffer pool settings")?);
    let manager = Arc::new(ConnManager::new(buffer_pool));

    let charset_index = charset::index_of(&system.charset).unwrap_or(charset::DEFAULT_CHARSET_INDEX);
    let connector: Arc<dyn Connector> = Arc::new(MysqlConnector::new(charset_index, BACKEND_CONNECT_TIMEOUT));

    // Data hosts
    let mut pools = HashMap::new();
    for host in &config.data_hosts {
        let schemas = host
            .schemas(&config.data_nodes)
            .into_iter()
            .map(str::to_string)
            .collect();
        let pool = PhysicalDbPool::new(
            host.clone(),
            schemas,
            connector.clone(),
            manager.clone(),
            Duration::from_millis(system.idle_timeout_ms),
            Duration::from_millis(system.heartbeat_timeout_ms),
        )?;
        if pool.init(0).await {
            info!(pool = %host.name, "Data host initialized");
        } else {
            warn!(pool = %host.name, "Data host failed to initialize, statements will be refused");
        }
        pools.insert(host.name.clone(), Arc::new(pool));
    }

    let heartbeats = HeartbeatScheduler::new(Duration::from_millis(system.heartbeat_period_ms));
    for pool in pools.values() {
        heartbeats.schedule_pool(pool);
    }

    let shutdown = CancellationToken::new();
    let idle_check = manager.spawn_idle_check(
        Duration::from_millis(system.idle_check_period_ms),
        shutdown.child_token(),
    );

    if let Some(addr) = system.metrics_addr.clone() {
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let router = Arc::new(DefaultNodeRouter::from_config(&config));
    let executor = Arc::new(NodeExecutor::from_config(&config, router, &pools)?);
    let ctx = FrontContext::new(
        system.clone(),
        manager.clone(),
        Arc::new(ConfigPrivileges::from_config(&config)),
        executor,
    );

    let addr = format!("{}:{}", system.listen_addr, system.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Athena gateway listening");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                }

                let front = FrontConnection::new(ctx.clone(), peer_addr.ip().to_string(), peer_addr.port());
                let conn_id = front.id();
                info!(conn_id, peer = %peer_addr, "New connection");

                tokio::spawn(async move {
                    match front.run(stream).await {
                        Ok(()) => info!(conn_id, "Connection ended"),
                        Err(e) => warn!(conn_id, error = %e, "Connection ended with error"),
                    }
                });
            }
        }
    }

    shutdown.cancel();
    let closing = manager.close_fronts();
    info!(count = closing, "Closing client connections");
    heartbeats.cancel(true).await;
    let _ = idle_check.await;
    for pool in pools.values() {
        pool.shutdown().await;
    }
    info!("Athena gateway stopped");
    Ok(())
}

fn load_or_default_config() -> anyhow::Result<Config> {
    if let Some(path) = std::env::args().nth(1) {
        let config = config::load_config(&path).with_context(|| format!("failed to load {}", path))?;
        info!(path = %path, "Loaded configuration");
        return Ok(config);
    }

    let config_paths = ["config/athena.toml", "athena.toml"];
    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return Ok(config);
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Ok(Config::default())
}
