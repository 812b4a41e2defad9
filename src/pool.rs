//! Pooled connections and the per-upstream connection pool
//!
//! A [`PooledConn`] owns one transport socket together with the state a
//! stream exchange needs to reuse it safely: the framing state left behind
//! by the previous read, a per-connection transaction ID, and the time of
//! the last successful I/O.
//!
//! [`ConnPool`] caches idle connections LIFO under a mutex. `get` pops the
//! most recently used connection; `put` appends. Both run an opportunistic
//! clean first. Ownership transfers out of the pool on `get`, so at most
//! one exchange ever holds a given connection; the mutex is never held
//! across I/O (dropping a tokio socket only closes a file descriptor).
//!
//! Entries are ordered by non-decreasing idle time from the front, because
//! `put` always appends and `get` always pops the tail. A stale tail
//! therefore implies a fully stale pool, and `get` reacts to one with a
//! forced full clean.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;

use crate::buffer::{MsgBufferPool, PooledBuffer};
use crate::codec::{self, FrameState, ReadProgress, WriteProgress};
use crate::error::DnsResult;

/// Largest number of idle connections a pool will hold
pub(crate) const POOL_MAX_SIZE: usize = 0xffff;

/// The owned transport under a pooled connection
#[derive(Debug)]
pub(crate) enum Transport {
    /// Connected UDP datagram socket
    Udp(UdpSocket),
    /// Plain TCP stream
    Tcp(TcpStream),
    /// TLS over TCP
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Write one query message with the transport's framing.
    pub(crate) async fn write_msg(
        &mut self,
        pool: &Arc<MsgBufferPool>,
        msg: &[u8],
        progress: &mut WriteProgress,
    ) -> DnsResult<()> {
        match self {
            Self::Udp(sock) => codec::write_udp_msg(sock, msg, progress).await,
            Self::Tcp(stream) => codec::write_stream_msg(stream, pool, msg, progress).await,
            Self::Tls(stream) => codec::write_stream_msg(stream.as_mut(), pool, msg, progress).await,
        }
    }

    /// Read one reply message with the transport's framing.
    pub(crate) async fn read_msg(
        &mut self,
        pool: &Arc<MsgBufferPool>,
        progress: &mut ReadProgress,
    ) -> DnsResult<PooledBuffer> {
        match self {
            Self::Udp(sock) => codec::read_udp_msg(sock, pool, progress).await,
            Self::Tcp(stream) => codec::read_stream_msg(stream, pool, progress).await,
            Self::Tls(stream) => codec::read_stream_msg(stream.as_mut(), pool, progress).await,
        }
    }

    /// Read and discard `left` residual bytes of a prior reply.
    ///
    /// Datagram transports never carry residue.
    pub(crate) async fn drain(
        &mut self,
        pool: &Arc<MsgBufferPool>,
        left: usize,
        progress: &mut ReadProgress,
    ) -> DnsResult<()> {
        match self {
            Self::Udp(_) => Ok(()),
            Self::Tcp(stream) => codec::drain_stream(stream, pool, left, progress).await,
            Self::Tls(stream) => codec::drain_stream(stream.as_mut(), pool, left, progress).await,
        }
    }
}

/// One cached upstream connection
///
/// Exclusively owned by the pool while idle and lent to exactly one
/// exchange while active. Dropping it closes the socket.
#[derive(Debug)]
pub(crate) struct PooledConn {
    /// The owned transport
    pub(crate) transport: Transport,
    /// Framing state left by the last read on this connection
    pub(crate) frame: FrameState,
    /// Transaction ID written into the next outgoing query
    pub(crate) msg_id: u16,
    /// Time of the last successful read or write of at least one byte
    pub(crate) last_io: Instant,
}

impl PooledConn {
    pub(crate) fn new(transport: Transport) -> Self {
        Self {
            transport,
            frame: FrameState::Clean,
            msg_id: rand::random(),
            last_io: Instant::now(),
        }
    }

    /// Advance the transaction ID for a new query on a reused connection.
    pub(crate) fn bump_msg_id(&mut self) {
        self.msg_id = self.msg_id.wrapping_add(1);
    }

    /// Record successful I/O.
    pub(crate) fn touch(&mut self) {
        self.last_io = Instant::now();
    }
}

struct PoolInner {
    entries: Vec<PooledConn>,
    last_clean: Instant,
}

/// LIFO cache of idle connections with TTL eviction
///
/// Disabled (never stores anything) when constructed with a zero size or
/// TTL; `get` then always misses and `put` closes the connection.
pub(crate) struct ConnPool {
    max_size: usize,
    ttl: Duration,
    gc_interval: Duration,
    inner: Mutex<PoolInner>,
}

impl ConnPool {
    pub(crate) fn new(max_size: usize, ttl: Duration, gc_interval: Duration) -> Self {
        Self {
            max_size,
            ttl,
            gc_interval,
            inner: Mutex::new(PoolInner {
                entries: Vec::new(),
                last_clean: Instant::now(),
            }),
        }
    }

    fn enabled(&self) -> bool {
        self.max_size > 0 && !self.ttl.is_zero()
    }

    /// Pop the most recently returned connection, if any is still fresh.
    ///
    /// A stale tail entry is closed and triggers a forced full clean,
    /// since insertion order tracks freshness.
    pub(crate) fn get(&self) -> Option<PooledConn> {
        if !self.enabled() {
            return None;
        }

        let mut inner = self.inner.lock();
        self.clean(&mut inner, false);

        let conn = inner.entries.pop()?;
        if conn.last_io.elapsed() > self.ttl {
            drop(conn);
            self.clean(&mut inner, true);
            return None;
        }
        Some(conn)
    }

    /// Return a connection to the pool.
    ///
    /// Connections with broken framing are closed instead, as is anything
    /// handed to a disabled or full pool.
    pub(crate) fn put(&self, conn: PooledConn) {
        if conn.frame.is_broken() || !self.enabled() {
            return;
        }

        let mut inner = self.inner.lock();
        self.clean(&mut inner, false);

        if inner.entries.len() >= self.max_size {
            return; // full, drop the connection
        }
        inner.entries.push(conn);
    }

    /// Number of idle connections currently cached.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Sweep expired entries; at capacity, additionally drop the oldest
    /// half regardless of age to bound lock-hold time under churn.
    fn clean(&self, inner: &mut PoolInner, force: bool) {
        if force || inner.last_clean.elapsed() >= self.gc_interval {
            inner.last_clean = Instant::now();
            let ttl = self.ttl;
            inner.entries.retain(|c| c.last_io.elapsed() < ttl);
        }

        if inner.entries.len() >= self.max_size {
            let mid = inner.entries.len() / 2;
            inner.entries.drain(..mid);
            let ttl = self.ttl;
            inner.entries.retain(|c| c.last_io.elapsed() < ttl);
        }
    }
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPool")
            .field("max_size", &self.max_size)
            .field("ttl", &self.ttl)
            .field("gc_interval", &self.gc_interval)
            .field("idle", &self.len())
            .finish()
    }
}
