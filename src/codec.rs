//! Framed wire-message I/O
//!
//! Two codec pairs move DNS wire-messages across the supported transports:
//!
//! - **UDP**: one datagram per message, no framing.
//! - **TCP/TLS**: RFC 1035 §4.2.2 framing, a 2-byte big-endian length
//!   prefix followed by exactly that many bytes.
//!
//! Stream reads record their progress in a caller-owned [`ReadProgress`] so
//! that an interrupted read (a dropped future or an I/O error) still leaves
//! behind an exact [`FrameState`]: how many bytes of the announced frame
//! remain unread, or that framing is unrecoverable. The exchange loop uses
//! that state to decide between recycling and closing a connection.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;

use crate::buffer::{MsgBufferPool, PooledBuffer};
use crate::error::{DnsError, DnsResult};

/// Maximum size of a DNS wire-message in bytes
pub const DNS_MAX_MSG_SIZE: usize = 65535;

/// Size of the fixed DNS header; no valid message is shorter
pub const DNS_HEADER_LEN: usize = 12;

/// Length of the stream framing prefix
pub(crate) const FRAME_PREFIX_LEN: usize = 2;

/// Framing state of a stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// The stream sits at a message boundary
    Clean,
    /// A frame was partially read; this many bytes of it are still unread
    Residue(usize),
    /// Framing is unrecoverable; the connection must not be reused
    Broken,
}

impl FrameState {
    /// Whether the framing is unrecoverable
    #[must_use]
    pub fn is_broken(self) -> bool {
        matches!(self, Self::Broken)
    }

    /// Unread bytes of a partially-read frame, 0 otherwise
    #[must_use]
    pub fn residue(self) -> usize {
        match self {
            Self::Residue(n) => n,
            _ => 0,
        }
    }
}

/// Progress record for one stream read
///
/// Owned by the caller and updated as bytes arrive, so the state survives
/// the read future being dropped mid-message.
#[derive(Debug)]
pub(crate) struct ReadProgress {
    consumed: usize,
    frame: FrameState,
}

impl ReadProgress {
    /// Progress for reading one framed message; framing counts as broken
    /// until the length prefix is complete.
    pub(crate) fn message() -> Self {
        Self {
            consumed: 0,
            frame: FrameState::Broken,
        }
    }

    /// Progress for draining `left` residual bytes of a known frame.
    pub(crate) fn drain(left: usize) -> Self {
        Self {
            consumed: 0,
            frame: FrameState::Residue(left),
        }
    }

    /// Total bytes consumed from the transport so far
    pub(crate) fn consumed(&self) -> usize {
        self.consumed
    }

    /// Framing state as of the last observed byte
    pub(crate) fn frame(&self) -> FrameState {
        self.frame
    }

    fn advance(&mut self, n: usize) {
        self.consumed += n;
        if let FrameState::Residue(left) = self.frame {
            let left = left.saturating_sub(n);
            self.frame = if left == 0 {
                FrameState::Clean
            } else {
                FrameState::Residue(left)
            };
        }
    }
}

/// Progress record for one message write
#[derive(Debug, Default)]
pub(crate) struct WriteProgress {
    written: usize,
}

impl WriteProgress {
    /// Total bytes handed to the transport so far
    pub(crate) fn written(&self) -> usize {
        self.written
    }
}

/// Fill `buf` completely, advancing `progress` per chunk.
async fn read_full<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
    progress: &mut ReadProgress,
) -> DnsResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r
            .read(&mut buf[filled..])
            .await
            .map_err(|e| DnsError::network_io("read from upstream", e))?;
        if n == 0 {
            return Err(DnsError::network("connection closed by upstream"));
        }
        filled += n;
        progress.advance(n);
    }
    Ok(())
}

/// Read one length-prefixed message from a stream transport.
///
/// `progress` must come from [`ReadProgress::message`]. On success the
/// recorded frame state is [`FrameState::Clean`]; on failure it reflects
/// exactly where the read stopped.
pub(crate) async fn read_stream_msg<R: AsyncRead + Unpin>(
    r: &mut R,
    pool: &Arc<MsgBufferPool>,
    progress: &mut ReadProgress,
) -> DnsResult<PooledBuffer> {
    let mut len_buf = [0u8; FRAME_PREFIX_LEN];
    read_full(r, &mut len_buf, progress).await?;

    let len = usize::from(u16::from_be_bytes(len_buf));
    if len < DNS_HEADER_LEN {
        // The announcement itself is valid framing; skipping `len` bytes
        // would leave the stream at a boundary.
        progress.frame = if len == 0 {
            FrameState::Clean
        } else {
            FrameState::Residue(len)
        };
        return Err(DnsError::ShortRead);
    }

    progress.frame = FrameState::Residue(len);
    let mut buf = pool.acquire(len);
    read_full(r, &mut buf, progress).await?;
    Ok(buf)
}

/// Read and discard `left` residual bytes of a partially-read frame.
///
/// `progress` must come from [`ReadProgress::drain`].
pub(crate) async fn drain_stream<R: AsyncRead + Unpin>(
    r: &mut R,
    pool: &Arc<MsgBufferPool>,
    left: usize,
    progress: &mut ReadProgress,
) -> DnsResult<()> {
    let mut buf = pool.acquire(left);
    read_full(r, &mut buf, progress).await
}

/// Write one message to a stream transport with the 2-byte length prefix.
pub(crate) async fn write_stream_msg<W: AsyncWrite + Unpin>(
    w: &mut W,
    pool: &Arc<MsgBufferPool>,
    msg: &[u8],
    progress: &mut WriteProgress,
) -> DnsResult<()> {
    let Ok(len) = u16::try_from(msg.len()) else {
        return Err(DnsError::FrameTooLarge { len: msg.len() });
    };

    let mut framed = pool.acquire(FRAME_PREFIX_LEN + msg.len());
    framed[..FRAME_PREFIX_LEN].copy_from_slice(&len.to_be_bytes());
    framed[FRAME_PREFIX_LEN..].copy_from_slice(msg);

    let mut sent = 0;
    while sent < framed.len() {
        let n = w
            .write(&framed[sent..])
            .await
            .map_err(|e| DnsError::network_io("write to upstream", e))?;
        if n == 0 {
            return Err(DnsError::network("connection closed during write"));
        }
        sent += n;
        progress.written += n;
    }
    w.flush()
        .await
        .map_err(|e| DnsError::network_io("flush to upstream", e))?;
    Ok(())
}

/// Read one reply datagram from a connected UDP socket.
///
/// The progress frame state stays [`FrameState::Broken`] on any failure;
/// UDP sockets carry no recoverable framing.
pub(crate) async fn read_udp_msg(
    sock: &UdpSocket,
    pool: &Arc<MsgBufferPool>,
    progress: &mut ReadProgress,
) -> DnsResult<PooledBuffer> {
    let mut buf = pool.acquire(DNS_MAX_MSG_SIZE);
    let n = sock
        .recv(&mut buf)
        .await
        .map_err(|e| DnsError::network_io("read datagram from upstream", e))?;
    progress.advance(n);
    if n < DNS_HEADER_LEN {
        return Err(DnsError::ShortRead);
    }
    buf.truncate(n);
    progress.frame = FrameState::Clean;
    Ok(buf)
}

/// Send one query datagram on a connected UDP socket.
pub(crate) async fn write_udp_msg(
    sock: &UdpSocket,
    msg: &[u8],
    progress: &mut WriteProgress,
) -> DnsResult<()> {
    let n = sock
        .send(msg)
        .await
        .map_err(|e| DnsError::network_io("send datagram to upstream", e))?;
    progress.written += n;
    if n != msg.len() {
        return Err(DnsError::network("partial datagram write"));
    }
    Ok(())
}

/// Read the transaction ID from a wire-message.
///
/// # Panics
///
/// Panics if `msg` is shorter than 2 bytes; callers validate the header
/// length first.
#[must_use]
pub fn msg_id(msg: &[u8]) -> u16 {
    u16::from_be_bytes([msg[0], msg[1]])
}

/// Overwrite the transaction ID of a wire-message.
///
/// # Panics
///
/// Panics if `msg` is shorter than 2 bytes.
pub fn set_msg_id(id: u16, msg: &mut [u8]) {
    msg[..2].copy_from_slice(&id.to_be_bytes());
}

/// Overwrite the transaction ID and return the previous one.
///
/// # Panics
///
/// Panics if `msg` is shorter than 2 bytes.
pub fn swap_msg_id(id: u16, msg: &mut [u8]) -> u16 {
    let old = msg_id(msg);
    set_msg_id(id, msg);
    old
}
