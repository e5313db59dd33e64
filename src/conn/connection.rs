use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ConnManager;
use crate::buffer::{AllocOptions, BufferError, PooledBuffer};
use crate::protocol::charset;
use crate::protocol::packet::PACKET_HEADER_SIZE;

/// Connection ids are unique across front and back connections
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> u64 {
    CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Client-facing
    Front,
    /// Backend-facing
    Back,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Front => "front",
            ConnectionKind::Back => "back",
        }
    }
}

/// State of a connection visible to the manager and the idle checker
///
/// The owning task keeps the `Connection`; everyone else holds this handle.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    kind: ConnectionKind,
    host: String,
    port: u16,
    startup: Instant,
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
    idle_timeout: Duration,
    closed: AtomicBool,
    /// Fired when someone else wants the owner to close
    shutdown: CancellationToken,
    net_in: AtomicU64,
    net_out: AtomicU64,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn startup(&self) -> Instant {
        self.startup
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn last_read(&self) -> Instant {
        *self.last_read.lock()
    }

    pub fn last_write(&self) -> Instant {
        *self.last_write.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn record_read(&self, bytes: usize) {
        *self.last_read.lock() = Instant::now();
        self.net_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        *self.last_write.lock() = Instant::now();
        self.net_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn net_in(&self) -> u64 {
        self.net_in.load(Ordering::Relaxed)
    }

    pub fn net_out(&self) -> u64 {
        self.net_out.load(Ordering::Relaxed)
    }

    /// No traffic in either direction for longer than the idle timeout
    pub fn is_idle(&self, now: Instant) -> bool {
        let last_active = self.last_read().max(self.last_write());
        now.saturating_duration_since(last_active) > self.idle_timeout
    }

    /// Ask the owner to close
    pub fn request_close(&self) {
        self.shutdown.cancel();
    }

    pub fn close_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token fired by [`request_close`](Self::request_close)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Per-socket state shared by front and back connections
#[derive(Debug)]
pub struct Connection {
    handle: Arc<ConnectionHandle>,
    manager: Option<Arc<ConnManager>>,
    write_buffer: Option<PooledBuffer>,
    pub schema: Option<String>,
    pub autocommit: bool,
    charset: String,
    charset_index: u8,
    pub max_packet_size: usize,
    pub max_allowed_packet: usize,
    pub packet_header_size: usize,
    pub support_compress: bool,
}

impl Connection {
    pub fn new(kind: ConnectionKind, host: impl Into<String>, port: u16, idle_timeout: Duration) -> Self {
        let now = Instant::now();
        let handle = Arc::new(ConnectionHandle {
            id: next_connection_id(),
            kind,
            host: host.into(),
            port,
            startup: now,
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
            idle_timeout,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            net_in: AtomicU64::new(0),
            net_out: AtomicU64::new(0),
        });

        Self {
            handle,
            manager: None,
            write_buffer: None,
            schema: None,
            autocommit: true,
            charset: "utf8".to_string(),
            charset_index: charset::DEFAULT_CHARSET_INDEX,
            max_packet_size: 16 * 1024 * 1024,
            max_allowed_packet: 16 * 1024 * 1024,
            packet_header_size: PACKET_HEADER_SIZE,
            support_compress: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub fn manager(&self) -> Option<&Arc<ConnManager>> {
        self.manager.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn charset_index(&self) -> u8 {
        self.charset_index
    }

    /// Adopt a collation index; unknown indexes are ignored
    pub fn set_charset_index(&mut self, index: u8) -> bool {
        match charset::name_of(index) {
            Some(name) => {
                self.charset = name.to_string();
                self.charset_index = index;
                true
            }
            None => false,
        }
    }

    pub fn set_charset(&mut self, name: &str) -> bool {
        match charset::index_of(name) {
            Some(index) => {
                self.charset = name.to_ascii_lowercase();
                self.charset_index = index;
                true
            }
            None => false,
        }
    }

    /// Register with a manager and take a write buffer from its pool
    pub async fn attach(&mut self, manager: Arc<ConnManager>) -> Result<(), BufferError> {
        let buffer = manager
            .buffer_pool()
            .allocate(None, AllocOptions::default())
            .await?;
        self.write_buffer = Some(buffer);
        manager.register(self.handle.clone());
        self.manager = Some(manager);
        Ok(())
    }

    pub fn write_buffer(&self) -> Option<&PooledBuffer> {
        self.write_buffer.as_ref()
    }

    pub fn write_buffer_mut(&mut self) -> Option<&mut PooledBuffer> {
        self.write_buffer.as_mut()
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        self.handle.is_idle(now)
    }

    /// Close once: release the write buffer and deregister.
    ///
    /// Returns false if the connection was already closed.
    pub fn close(&mut self, reason: &str) -> bool {
        if self.handle.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.handle.shutdown.cancel();

        if let Some(manager) = self.manager.take() {
            if let Some(mut buffer) = self.write_buffer.take() {
                manager.buffer_pool().release(&mut buffer);
            }
            manager.deregister(&self.handle);
        }
        self.write_buffer = None;

        debug!(
            conn_id = self.handle.id,
            side = self.handle.kind.as_str(),
            reason = %reason,
            "Connection closed"
        );
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close("dropped");
    }
}
