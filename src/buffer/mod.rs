//! Bounded byte-buffer allocator shared by every connection
//!
//! The pool hands out chunk-rounded buffers and keeps a byte counter that
//! never exceeds `page_size * page_count`. Callers that cannot proceed without
//! memory may wait for capacity; every release wakes all waiters, which then
//! re-check their own requirement.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::SystemConfig;
use crate::metrics::metrics;

/// Source of pool identities, used to recognise buffers handed out by a pool
static POOL_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Buffer allocation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("Buffer pool exhausted: requested {requested} bytes, {allocated} of {total} in use")]
    Exhausted {
        requested: usize,
        allocated: usize,
        total: usize,
    },

    #[error("Requested {requested} bytes exceeds pool capacity of {total}")]
    TooLarge { requested: usize, total: usize },

    #[error("Invalid buffer pool argument: {0}")]
    InvalidArgument(String),
}

/// Options for a single allocation
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocOptions {
    /// Clear the returned bytes. When false a recycled buffer may carry stale data.
    pub zeroed: bool,
    /// Suspend until a release frees enough capacity instead of failing
    pub wait: bool,
}

impl AllocOptions {
    pub fn waiting() -> Self {
        Self {
            zeroed: false,
            wait: true,
        }
    }

    pub fn zeroed() -> Self {
        Self {
            zeroed: true,
            wait: false,
        }
    }
}

/// A byte buffer paired with the metadata of the pool that produced it
#[derive(Debug)]
pub struct PooledBuffer {
    data: BytesMut,
    /// Identity of the owning pool; `None` for buffers created outside any pool
    pool_id: Option<u64>,
    /// Chunk-rounded size accounted against the pool
    nominal: usize,
    /// Still counted as allocated by the owning pool
    live: bool,
}

impl PooledBuffer {
    /// Wrap a buffer that did not come from a pool. Releasing it always fails.
    pub fn detached(len: usize) -> Self {
        Self {
            data: BytesMut::zeroed(len),
            pool_id: None,
            nominal: len,
            live: false,
        }
    }

    /// Size accounted against the pool
    pub fn nominal_size(&self) -> usize {
        self.nominal
    }

    /// Whether the buffer is still outstanding in its pool
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

struct PoolState {
    allocated: usize,
    /// Released storage kept for reuse
    free: Vec<BytesMut>,
}

/// Process-wide bounded buffer allocator
pub struct BufferPool {
    id: u64,
    chunk_size: usize,
    page_size: usize,
    page_count: usize,
    total_size: usize,
    max_free: usize,
    state: Mutex<PoolState>,
    released: Notify,
}

impl BufferPool {
    pub fn new(chunk_size: usize, page_size: usize, page_count: usize) -> Result<Self, BufferError> {
        if chunk_size == 0 {
            return Err(BufferError::InvalidArgument("chunk_size must be positive".into()));
        }
        if page_size == 0 || page_count == 0 {
            return Err(BufferError::InvalidArgument(
                "page_size and page_count must be positive".into(),
            ));
        }
        let total_size = page_size
            .checked_mul(page_count)
            .ok_or_else(|| BufferError::InvalidArgument("pool size overflows".into()))?;
        if chunk_size > total_size {
            return Err(BufferError::InvalidArgument(format!(
                "chunk_size {} larger than pool size {}",
                chunk_size, total_size
            )));
        }

        Ok(Self {
            id: POOL_COUNTER.fetch_add(1, Ordering::Relaxed),
            chunk_size,
            page_size,
            page_count,
            total_size,
            max_free: page_count,
            state: Mutex::new(PoolState {
                allocated: 0,
                free: Vec::new(),
            }),
            released: Notify::new(),
        })
    }

    pub fn from_config(config: &SystemConfig) -> Result<Self, BufferError> {
        Self::new(
            config.processor_buffer_chunk,
            config.buffer_page_size,
            config.buffer_page_count,
        )
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Bytes currently handed out
    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }

    pub fn available(&self) -> usize {
        self.total_size - self.allocated()
    }

    /// Released buffers waiting for reuse
    pub fn recycled(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Round a request up to the allocation granularity
    pub fn rounded_size(&self, size: Option<usize>) -> usize {
        match size {
            None | Some(0) => self.chunk_size,
            Some(n) => n.div_ceil(self.chunk_size) * self.chunk_size,
        }
    }

    /// Allocate without suspending
    pub fn try_allocate(&self, size: Option<usize>, zeroed: bool) -> Result<PooledBuffer, BufferError> {
        let len = self.rounded_size(size);
        if len > self.total_size {
            return Err(BufferError::TooLarge {
                requested: len,
                total: self.total_size,
            });
        }

        // check and reserve under one lock
        let recycled = {
            let mut state = self.state.lock();
            if state.allocated + len > self.total_size {
                return Err(BufferError::Exhausted {
                    requested: len,
                    allocated: state.allocated,
                    total: self.total_size,
                });
            }
            state.allocated += len;
            metrics().buffer_allocated_bytes.set(state.allocated as i64);
            state
                .free
                .iter()
                .position(|b| b.capacity() == len)
                .map(|idx| state.free.swap_remove(idx))
        };

        let data = match recycled {
            Some(mut data) if zeroed => {
                data.clear();
                data.resize(len, 0);
                data
            }
            Some(mut data) => {
                if data.len() >= len {
                    data.truncate(len);
                } else {
                    data.resize(len, 0);
                }
                data
            }
            None => BytesMut::zeroed(len),
        };

        Ok(PooledBuffer {
            data,
            pool_id: Some(self.id),
            nominal: len,
            live: true,
        })
    }

    /// Allocate a buffer, optionally waiting for capacity
    pub async fn allocate(&self, size: Option<usize>, opts: AllocOptions) -> Result<PooledBuffer, BufferError> {
        loop {
            // Register interest before checking so a release between the
            // check and the await is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_allocate(size, opts.zeroed) {
                Ok(buf) => return Ok(buf),
                Err(BufferError::Exhausted { requested, allocated, .. }) if opts.wait => {
                    debug!(requested, allocated, "Waiting for buffer capacity");
                    notified.await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Return a buffer to the pool
    ///
    /// Returns false for buffers produced elsewhere or already released.
    pub fn release(&self, buf: &mut PooledBuffer) -> bool {
        if buf.pool_id != Some(self.id) || !buf.live {
            return false;
        }
        buf.live = false;

        {
            let mut state = self.state.lock();
            state.allocated -= buf.nominal;
            metrics().buffer_allocated_bytes.set(state.allocated as i64);
            // storage that grew past its accounted size is dropped
            let data = std::mem::take(&mut buf.data);
            if data.capacity() == buf.nominal && state.free.len() < self.max_free {
                state.free.push(data);
            }
        }

        self.released.notify_waiters();
        true
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("chunk_size", &self.chunk_size)
            .field("total_size", &self.total_size)
            .field("allocated", &self.allocated())
            .finish()
    }
}
