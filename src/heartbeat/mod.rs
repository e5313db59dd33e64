//! Backend health probing
//!
//! Each data source owns a `DbHeartbeat`. A `HeartbeatScheduler` drives the
//! probes on a period and reaps expired idle connections on the same tick.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::metrics;
use crate::pool::{PhysicalDataSource, PhysicalDbPool};

/// Result of the most recent probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeartbeatStatus {
    Init = 0,
    Ok = 1,
    Error = 2,
    Timeout = 3,
}

impl HeartbeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatStatus::Init => "init",
            HeartbeatStatus::Ok => "ok",
            HeartbeatStatus::Error => "error",
            HeartbeatStatus::Timeout => "timeout",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => HeartbeatStatus::Ok,
            2 => HeartbeatStatus::Error,
            3 => HeartbeatStatus::Timeout,
            _ => HeartbeatStatus::Init,
        }
    }
}

/// Health probe bound to one data source
pub struct DbHeartbeat {
    source: Weak<PhysicalDataSource>,
    sql: String,
    max_retry_count: u32,
    timeout: Duration,
    status: AtomicU8,
    stopped: AtomicBool,
    last_send: Mutex<Option<Instant>>,
    last_recv: Mutex<Option<Instant>>,
}

impl DbHeartbeat {
    /// Created stopped, with status `Init`
    pub fn new(source: Weak<PhysicalDataSource>, sql: String, max_retry_count: u32, timeout: Duration) -> Self {
        Self {
            source,
            sql,
            max_retry_count,
            timeout,
            status: AtomicU8::new(HeartbeatStatus::Init as u8),
            stopped: AtomicBool::new(true),
            last_send: Mutex::new(None),
            last_recv: Mutex::new(None),
        }
    }

    pub fn status(&self) -> HeartbeatStatus {
        HeartbeatStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn last_send_time(&self) -> Option<Instant> {
        *self.last_send.lock()
    }

    pub fn last_recv_time(&self) -> Option<Instant> {
        *self.last_recv.lock()
    }

    fn source_name(&self) -> String {
        self.source
            .upgrade()
            .map(|s| s.name().to_string())
            .unwrap_or_default()
    }

    /// Arm the heartbeat. Without a probe statement it stays stopped.
    pub fn start(&self) -> bool {
        if self.sql.trim().is_empty() {
            warn!(datasource = %self.source_name(), "No heartbeat SQL configured, heartbeat stays stopped");
            self.stopped.store(true, Ordering::Release);
            return false;
        }
        self.stopped.store(false, Ordering::Release);
        true
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Probe the backend once (with retries) and record the outcome.
    ///
    /// Returns whether the backend answered. Does nothing when stopped.
    pub async fn heartbeat(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        let Some(source) = self.source.upgrade() else {
            return false;
        };

        *self.last_send.lock() = Some(Instant::now());

        let mut outcome = HeartbeatStatus::Error;
        for attempt in 0..=self.max_retry_count {
            outcome = self.probe(&source).await;
            if outcome == HeartbeatStatus::Ok {
                break;
            }
            debug!(
                datasource = %source.name(),
                attempt = attempt + 1,
                status = outcome.as_str(),
                "Heartbeat attempt failed"
            );
        }

        if outcome == HeartbeatStatus::Ok {
            *self.last_recv.lock() = Some(Instant::now());
        }
        self.record(&source, outcome);
        outcome == HeartbeatStatus::Ok
    }

    /// One probe on a fresh connection, which is always closed afterwards
    async fn probe(&self, source: &PhysicalDataSource) -> HeartbeatStatus {
        let mut conn = match tokio::time::timeout(self.timeout, source.open_probe()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                debug!(datasource = %source.name(), error = %e, "Heartbeat connect failed");
                return HeartbeatStatus::Error;
            }
            Err(_) => return HeartbeatStatus::Timeout,
        };

        let result = tokio::time::timeout(self.timeout, conn.query(&self.sql)).await;
        conn.close().await;

        match result {
            Ok(Ok(_)) => HeartbeatStatus::Ok,
            Ok(Err(e)) => {
                debug!(datasource = %source.name(), error = %e, "Heartbeat query failed");
                HeartbeatStatus::Error
            }
            Err(_) => HeartbeatStatus::Timeout,
        }
    }

    fn record(&self, source: &PhysicalDataSource, status: HeartbeatStatus) {
        let previous = HeartbeatStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel));
        metrics().record_heartbeat(source.name(), status.as_str());

        if previous == status {
            return;
        }
        match status {
            HeartbeatStatus::Ok => info!(
                datasource = %source.name(),
                from = previous.as_str(),
                "Heartbeat status changed to ok"
            ),
            _ => warn!(
                datasource = %source.name(),
                from = previous.as_str(),
                to = status.as_str(),
                "Heartbeat status changed"
            ),
        }
    }
}

impl std::fmt::Debug for DbHeartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHeartbeat")
            .field("sql", &self.sql)
            .field("status", &self.status())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Runs heartbeats for a set of data sources on a fixed period
pub struct HeartbeatScheduler {
    period: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HeartbeatScheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start every data source of `pool`
    pub fn schedule_pool(&self, pool: &PhysicalDbPool) {
        for source in pool.all_sources() {
            self.schedule(source);
        }
    }

    /// Arm the heartbeat of `source` and tick it in a background task
    pub fn schedule(&self, source: Arc<PhysicalDataSource>) {
        if !source.heartbeat().start() {
            return;
        }

        let cancel = self.cancel.child_token();
        let period = self.period;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(datasource = %source.name(), "Heartbeat task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        source.heartbeat().heartbeat().await;
                        source.reap_idle().await;
                    }
                }
            }
            source.heartbeat().stop();
        });

        self.tasks.lock().push(handle);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancel all tasks, waiting for them to finish when `join` is set
    pub async fn cancel(&self, join: bool) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if join {
            for task in tasks {
                let _ = task.await;
            }
        }
    }
}
