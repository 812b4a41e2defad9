//! Pooled wire-message buffers
//!
//! Every query copy, reply, and drain scratch area in this crate is
//! allocated through [`MsgBufferPool`], a lock-free free-list of
//! DNS-max-size byte buffers. Acquired buffers are wrapped in a
//! [`PooledBuffer`] guard that returns the underlying storage to the pool
//! when dropped, so every acquisition is released on every exit path,
//! including error returns.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use dns_upstream::MsgBufferPool;
//!
//! let pool = Arc::new(MsgBufferPool::new(64));
//! let mut buf = pool.acquire(12);
//! buf[0] = 0x12;
//! drop(buf);
//!
//! assert!(pool.stats().returns() > 0);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::codec::{DNS_MAX_MSG_SIZE, FRAME_PREFIX_LEN};

/// Default number of buffers kept on the free-list
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Capacity of every pooled buffer: a maximum-size message plus its
/// stream framing prefix
const BUFFER_CAPACITY: usize = DNS_MAX_MSG_SIZE + FRAME_PREFIX_LEN;

/// Counters for pool behavior
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    /// New allocations (free-list was empty)
    allocations: AtomicU64,
    /// Buffers reused from the free-list
    reuses: AtomicU64,
    /// Buffers returned to the free-list
    returns: AtomicU64,
    /// Buffers dropped because the free-list was full
    drops: AtomicU64,
}

impl BufferPoolStats {
    /// Number of new allocations
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of buffers reused from the free-list
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Number of buffers returned to the free-list
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Number of buffers dropped on return because the free-list was full
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Lock-free pool of wire-message buffers
///
/// Every buffer has capacity for a maximum-size DNS message, so reuse
/// never reallocates regardless of the requested length.
#[derive(Debug)]
pub struct MsgBufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    stats: BufferPoolStats,
}

impl MsgBufferPool {
    /// Create a pool keeping at most `capacity` idle buffers
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            stats: BufferPoolStats::default(),
        }
    }

    /// Create a pool with the default capacity
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }

    /// Acquire a zeroed buffer of exactly `len` bytes
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the size of a maximum framed DNS message.
    #[must_use]
    pub fn acquire(self: &Arc<Self>, len: usize) -> PooledBuffer {
        assert!(len <= BUFFER_CAPACITY, "buffer request beyond DNS maximum");

        let mut buffer = if let Some(buf) = self.buffers.pop() {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            buf
        } else {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            Vec::with_capacity(BUFFER_CAPACITY)
        };
        buffer.clear();
        buffer.resize(len, 0);

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    /// Acquire a buffer holding a copy of `data`
    ///
    /// # Panics
    ///
    /// Panics if `data` exceeds the size of a maximum framed DNS message.
    #[must_use]
    pub fn acquire_copy(self: &Arc<Self>, data: &[u8]) -> PooledBuffer {
        let mut buf = self.acquire(data.len());
        buf.copy_from_slice(data);
        buf
    }

    /// Number of buffers currently idle on the free-list
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Pool counters
    #[must_use]
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }

    fn return_buffer(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        match self.buffers.push(buffer) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_buf) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A wire-message buffer borrowed from a [`MsgBufferPool`]
///
/// Dereferences to its byte contents and returns the storage to the pool
/// when dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<MsgBufferPool>,
}

impl PooledBuffer {
    /// Shorten the buffer to `len` bytes
    ///
    /// Has no effect if `len` is not smaller than the current length.
    pub fn truncate(&mut self, len: usize) {
        if let Some(buf) = self.buffer.as_mut() {
            buf.truncate(len);
        }
    }

    /// Consume the guard, keeping the bytes out of the pool
    #[must_use]
    pub fn into_vec(mut self) -> Vec<u8> {
        self.buffer.take().unwrap_or_default()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or_default()
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.return_buffer(buffer);
        }
    }
}
