use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ConnectionHandle, ConnectionKind};
use crate::buffer::BufferPool;
use crate::metrics::metrics;
use crate::protocol::ClientCommand;

/// Per-command counters for client traffic
#[derive(Debug, Default)]
pub struct CommandCounters {
    query: AtomicU64,
    init_db: AtomicU64,
    ping: AtomicU64,
    quit: AtomicU64,
    other: AtomicU64,
}

impl CommandCounters {
    fn record(&self, command: &ClientCommand) {
        let counter = match command {
            ClientCommand::Query(_) => &self.query,
            ClientCommand::InitDb(_) => &self.init_db,
            ClientCommand::Ping => &self.ping,
            ClientCommand::Quit => &self.quit,
            _ => &self.other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn query(&self) -> u64 {
        self.query.load(Ordering::Relaxed)
    }

    pub fn init_db(&self) -> u64 {
        self.init_db.load(Ordering::Relaxed)
    }

    pub fn ping(&self) -> u64 {
        self.ping.load(Ordering::Relaxed)
    }

    pub fn quit(&self) -> u64 {
        self.quit.load(Ordering::Relaxed)
    }

    pub fn other(&self) -> u64 {
        self.other.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.query() + self.init_db() + self.ping() + self.quit() + self.other()
    }
}

/// Registry of live connections and their traffic statistics
#[derive(Debug)]
pub struct ConnManager {
    buffer_pool: Arc<BufferPool>,
    front: DashMap<u64, Arc<ConnectionHandle>>,
    back: DashMap<u64, Arc<ConnectionHandle>>,
    /// Authenticated front connections per user
    users: DashMap<String, usize>,
    net_in: AtomicU64,
    net_out: AtomicU64,
    commands: CommandCounters,
}

impl ConnManager {
    pub fn new(buffer_pool: Arc<BufferPool>) -> Self {
        Self {
            buffer_pool,
            front: DashMap::new(),
            back: DashMap::new(),
            users: DashMap::new(),
            net_in: AtomicU64::new(0),
            net_out: AtomicU64::new(0),
            commands: CommandCounters::default(),
        }
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    fn registry(&self, kind: ConnectionKind) -> &DashMap<u64, Arc<ConnectionHandle>> {
        match kind {
            ConnectionKind::Front => &self.front,
            ConnectionKind::Back => &self.back,
        }
    }

    pub fn register(&self, handle: Arc<ConnectionHandle>) {
        let kind = handle.kind();
        if self.registry(kind).insert(handle.id(), handle).is_none() {
            metrics().record_connection_opened(kind.as_str());
        }
    }

    /// Returns false if the connection was not registered
    pub fn deregister(&self, handle: &ConnectionHandle) -> bool {
        let removed = self.registry(handle.kind()).remove(&handle.id()).is_some();
        if removed {
            metrics().record_connection_closed(handle.kind().as_str());
        }
        removed
    }

    pub fn front_count(&self) -> usize {
        self.front.len()
    }

    pub fn back_count(&self) -> usize {
        self.back.len()
    }

    pub fn front(&self, id: u64) -> Option<Arc<ConnectionHandle>> {
        self.front.get(&id).map(|h| h.value().clone())
    }

    pub fn back(&self, id: u64) -> Option<Arc<ConnectionHandle>> {
        self.back.get(&id).map(|h| h.value().clone())
    }

    /// Count a login for `user` unless `limit` (0 = unlimited) is reached
    pub fn try_add_user(&self, user: &str, limit: usize) -> bool {
        let mut count = self.users.entry(user.to_string()).or_insert(0);
        if limit > 0 && *count >= limit {
            return false;
        }
        *count += 1;
        true
    }

    pub fn remove_user(&self, user: &str) {
        let empty = match self.users.get_mut(user) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if empty {
            self.users.remove_if(user, |_, count| *count == 0);
        }
    }

    pub fn user_connections(&self, user: &str) -> usize {
        self.users.get(user).map(|c| *c).unwrap_or(0)
    }

    /// Count bytes read from a client
    pub fn record_net_in(&self, bytes: usize) {
        self.net_in.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics().bytes_received_total.inc_by(bytes as u64);
    }

    /// Count bytes written to a client
    pub fn record_net_out(&self, bytes: usize) {
        self.net_out.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics().bytes_sent_total.inc_by(bytes as u64);
    }

    pub fn net_in(&self) -> u64 {
        self.net_in.load(Ordering::Relaxed)
    }

    pub fn net_out(&self) -> u64 {
        self.net_out.load(Ordering::Relaxed)
    }

    pub fn record_command(&self, command: &ClientCommand) {
        self.commands.record(command);
        metrics().record_command(command.name());
    }

    pub fn commands(&self) -> &CommandCounters {
        &self.commands
    }

    /// Ask every idle connection to close. Returns how many were asked.
    pub fn check_idle(&self, now: Instant) -> usize {
        let mut count = 0;
        for registry in [&self.front, &self.back] {
            for entry in registry.iter() {
                let handle = entry.value();
                if !handle.is_closed() && !handle.close_requested() && handle.is_idle(now) {
                    debug!(
                        conn_id = handle.id(),
                        side = handle.kind().as_str(),
                        "Closing idle connection"
                    );
                    handle.request_close();
                    count += 1;
                }
            }
        }
        count
    }

    /// Ask every front connection to close. Returns how many were asked.
    pub fn close_fronts(&self) -> usize {
        let mut count = 0;
        for entry in self.front.iter() {
            if !entry.value().close_requested() {
                entry.value().request_close();
                count += 1;
            }
        }
        count
    }

    /// Run [`check_idle`](Self::check_idle) every `period` until `shutdown` fires
    pub fn spawn_idle_check(self: &Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let closed = manager.check_idle(Instant::now());
                        if closed > 0 {
                            info!(count = closed, "Idle connections closed");
                        }
                    }
                }
            }
            debug!("Idle check stopped");
        })
    }
}
