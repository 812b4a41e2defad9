//! Stream upstreams: plain UDP, plain TCP and DNS-over-TLS
//!
//! One implementation serves all three transports; only the dialer and the
//! codec differ. An exchange walks a fixed sequence:
//!
//! 1. reuse a pooled connection or dial a fresh one
//! 2. copy the query and stamp it with the connection's transaction ID
//! 3. write, drain any residue of an earlier reply, then read
//! 4. match the reply's ID, recycle the connection, restore the caller's ID
//!
//! On a reused connection a reply with a foreign ID is a late answer to an
//! earlier query: the frame was consumed whole, so it is discarded and the
//! read repeats. On a new connection the same mismatch is a protocol error.
//! The first I/O failure on a reused connection triggers exactly one redial
//! with a fresh connection; everything else surfaces to the caller.
//!
//! Cancellation is checked before acquiring a connection, again after
//! dialing, and raced against every blocking I/O step. An exchange cut
//! short by cancellation recycles its connection whenever the framing state
//! is still known, and closes it otherwise.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::buffer::{MsgBufferPool, PooledBuffer};
use crate::codec::{self, FrameState, ReadProgress, WriteProgress, DNS_HEADER_LEN};
use crate::config::UpstreamConfig;
use crate::error::{DnsError, DnsResult};
use crate::pool::{ConnPool, PooledConn, Transport, POOL_MAX_SIZE};
use crate::tls;
use crate::upstream::Upstream;

/// Timeout for establishing a TCP connection or a connected UDP socket
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for completing a TLS handshake after the TCP dial
pub(crate) const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Pool TTL for connected UDP sockets
const UDP_POOL_TTL: Duration = Duration::from_secs(10);

/// Pool cleaning interval for connected UDP sockets
const UDP_POOL_GC_INTERVAL: Duration = Duration::from_secs(5);

/// How new connections are established
enum Dialer {
    Udp,
    Tcp,
    Dot {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

impl Dialer {
    fn protocol(&self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Dot { .. } => "dot",
        }
    }
}

/// Outcome of a single exchange attempt
enum Failure {
    /// Surface to the caller
    Fatal(DnsError),
    /// A reused connection failed; one redial is allowed
    Retry(DnsError),
}

impl Failure {
    fn into_error(self) -> DnsError {
        match self {
            Self::Fatal(e) | Self::Retry(e) => e,
        }
    }
}

/// Upstream resolver over UDP, TCP or TLS
///
/// # Example
///
/// ```no_run
/// use dns_upstream::{StreamUpstream, UpstreamConfig, UpstreamProtocol};
///
/// let config = UpstreamConfig::new("cloudflare", "1.1.1.1:53", UpstreamProtocol::Tcp);
/// let upstream = StreamUpstream::tcp(&config).expect("valid config");
/// assert_eq!(upstream.addr().port(), 53);
/// ```
pub struct StreamUpstream {
    tag: String,
    addr: SocketAddr,
    dialer: Dialer,
    pool: ConnPool,
    buffers: Arc<MsgBufferPool>,
}

impl std::fmt::Debug for StreamUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamUpstream")
            .field("tag", &self.tag)
            .field("protocol", &self.dialer.protocol())
            .field("addr", &self.addr)
            .field("idle_connections", &self.pool.len())
            .finish()
    }
}

impl StreamUpstream {
    /// Create a plain-UDP upstream
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the address cannot be parsed.
    pub fn udp(config: &UpstreamConfig) -> DnsResult<Self> {
        Ok(Self {
            tag: config.tag.clone(),
            addr: parse_addr(config)?,
            dialer: Dialer::Udp,
            pool: ConnPool::new(POOL_MAX_SIZE, UDP_POOL_TTL, UDP_POOL_GC_INTERVAL),
            buffers: Arc::new(MsgBufferPool::with_defaults()),
        })
    }

    /// Create a plain-TCP upstream
    ///
    /// The pool TTL is `config.tcp.idle_timeout` seconds; zero disables
    /// pooling.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the address cannot be parsed.
    pub fn tcp(config: &UpstreamConfig) -> DnsResult<Self> {
        let idle = Duration::from_secs(config.tcp.idle_timeout);
        Ok(Self {
            tag: config.tag.clone(),
            addr: parse_addr(config)?,
            dialer: Dialer::Tcp,
            pool: ConnPool::new(POOL_MAX_SIZE, idle, idle / 2),
            buffers: Arc::new(MsgBufferPool::with_defaults()),
        })
    }

    /// Create a DNS-over-TLS upstream
    ///
    /// `config.dot.server_name` is used for SNI and certificate
    /// verification and must not be empty. `root_cas` injects trust
    /// anchors; the bundled webpki roots are used when `None`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the address cannot be parsed or
    /// the server name is missing or invalid.
    pub fn dot(config: &UpstreamConfig, root_cas: Option<RootCertStore>) -> DnsResult<Self> {
        if config.dot.server_name.is_empty() {
            return Err(DnsError::config_field(
                "DoT requires a TLS server name",
                "dot.server_name",
            ));
        }
        let server_name: ServerName<'static> = config
            .dot
            .server_name
            .clone()
            .try_into()
            .map_err(|_| {
                DnsError::config_field(
                    format!("invalid TLS server name '{}'", config.dot.server_name),
                    "dot.server_name",
                )
            })?;

        let tls_config = tls::client_config(root_cas, config.insecure_skip_verify, &[]);
        let connector = TlsConnector::from(Arc::new(tls_config));

        let idle = Duration::from_secs(config.dot.idle_timeout);
        Ok(Self {
            tag: config.tag.clone(),
            addr: parse_addr(config)?,
            dialer: Dialer::Dot {
                connector,
                server_name,
            },
            pool: ConnPool::new(POOL_MAX_SIZE, idle, idle / 2),
            buffers: Arc::new(MsgBufferPool::with_defaults()),
        })
    }

    /// The address every dial goes to
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of idle connections currently pooled
    #[must_use]
    pub fn idle_connections(&self) -> usize {
        self.pool.len()
    }

    async fn dial_tcp(&self) -> DnsResult<TcpStream> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                DnsError::timeout(format!("TCP connection to {}", self.addr), DIAL_TIMEOUT)
            })?
            .map_err(|e| {
                DnsError::network_io(format!("failed to connect to {}", self.addr), e)
            })?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    async fn dial(&self) -> DnsResult<PooledConn> {
        let transport = match &self.dialer {
            Dialer::Udp => {
                let local = match self.addr {
                    SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                    SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
                };
                let connect = async {
                    let sock = UdpSocket::bind(local).await?;
                    sock.connect(self.addr).await?;
                    Ok::<_, std::io::Error>(sock)
                };
                let sock = timeout(DIAL_TIMEOUT, connect)
                    .await
                    .map_err(|_| {
                        DnsError::timeout(
                            format!("UDP connection to {}", self.addr),
                            DIAL_TIMEOUT,
                        )
                    })?
                    .map_err(|e| {
                        DnsError::network_io(
                            format!("failed to connect UDP socket to {}", self.addr),
                            e,
                        )
                    })?;
                Transport::Udp(sock)
            }
            Dialer::Tcp => Transport::Tcp(self.dial_tcp().await?),
            Dialer::Dot {
                connector,
                server_name,
            } => {
                // A handshake timeout or failure drops (closes) the TCP
                // socket consumed by the connector.
                let tcp = self.dial_tcp().await?;
                let tls_stream = timeout(
                    TLS_HANDSHAKE_TIMEOUT,
                    connector.connect(server_name.clone(), tcp),
                )
                .await
                .map_err(|_| {
                    DnsError::timeout(
                        format!("TLS handshake with {}", self.addr),
                        TLS_HANDSHAKE_TIMEOUT,
                    )
                })?
                .map_err(DnsError::tls_handshake)?;
                Transport::Tls(Box::new(tls_stream))
            }
        };
        Ok(PooledConn::new(transport))
    }

    /// Decide the fate of a connection after an I/O failure.
    ///
    /// A timeout-like failure while the caller's token is cancelled is
    /// attributable to the cancellation: the connection is recycled when
    /// its framing is known and the cancellation surfaces. Anything else
    /// closes the connection; a reused connection earns one redial.
    fn settle_io_error(
        &self,
        conn: PooledConn,
        is_new: bool,
        err: DnsError,
        ctx: &CancellationToken,
    ) -> Failure {
        let interrupted = matches!(err, DnsError::Cancelled | DnsError::Timeout { .. });
        if interrupted && ctx.is_cancelled() && !conn.frame.is_broken() {
            tracing::debug!(
                tag = %self.tag,
                addr = %self.addr,
                error = %err,
                "i/o cut short by cancellation, framing known, recycling connection"
            );
            self.pool.put(conn);
            return Failure::Fatal(DnsError::Cancelled);
        }

        drop(conn);
        if is_new {
            tracing::warn!(
                tag = %self.tag,
                addr = %self.addr,
                error = %err,
                "i/o error on new connection"
            );
            Failure::Fatal(err)
        } else {
            Failure::Retry(err)
        }
    }

    async fn exchange_once(
        &self,
        ctx: &CancellationToken,
        query: &[u8],
        force_new: bool,
    ) -> Result<PooledBuffer, Failure> {
        if ctx.is_cancelled() {
            return Err(Failure::Fatal(DnsError::Cancelled));
        }
        if query.len() < DNS_HEADER_LEN {
            return Err(Failure::Fatal(DnsError::ShortRead));
        }

        let (mut conn, is_new) = match (!force_new).then(|| self.pool.get()).flatten() {
            Some(mut conn) => {
                conn.bump_msg_id();
                (conn, false)
            }
            None => {
                let conn = self.dial().await.map_err(Failure::Fatal)?;
                // Dialing may have taken a while; a connection that was
                // never written to is safe to hand straight to the pool.
                if ctx.is_cancelled() {
                    self.pool.put(conn);
                    return Err(Failure::Fatal(DnsError::Cancelled));
                }
                (conn, true)
            }
        };

        // The caller's bytes stay untouched; the ID swap happens on a copy.
        let mut qbuf = self.buffers.acquire_copy(query);
        let original_id = codec::swap_msg_id(conn.msg_id, &mut qbuf);

        let mut wp = WriteProgress::default();
        let write_res = tokio::select! {
            biased;
            () = ctx.cancelled() => Err(DnsError::Cancelled),
            res = conn.transport.write_msg(&self.buffers, &qbuf, &mut wp) => res,
        };
        if wp.written() > 0 {
            conn.touch();
        }
        if let Err(err) = write_res {
            return Err(self.settle_io_error(conn, is_new, err, ctx));
        }

        // Clear out the unread remainder of an earlier reply before
        // looking for ours.
        if let FrameState::Residue(left) = conn.frame {
            let mut rp = ReadProgress::drain(left);
            let drain_res = tokio::select! {
                biased;
                () = ctx.cancelled() => Err(DnsError::Cancelled),
                res = conn.transport.drain(&self.buffers, left, &mut rp) => res,
            };
            if rp.consumed() > 0 {
                conn.touch();
            }
            conn.frame = rp.frame();
            if let Err(err) = drain_res {
                return Err(self.settle_io_error(conn, is_new, err, ctx));
            }
        }

        loop {
            let mut rp = ReadProgress::message();
            let read_res = tokio::select! {
                biased;
                () = ctx.cancelled() => Err(DnsError::Cancelled),
                res = conn.transport.read_msg(&self.buffers, &mut rp) => res,
            };
            if rp.consumed() > 0 {
                conn.touch();
            }
            conn.frame = rp.frame();

            match read_res {
                Ok(mut reply) => {
                    if codec::msg_id(&reply) != conn.msg_id {
                        if is_new {
                            // A fresh connection has nothing in flight; a
                            // foreign ID is a protocol violation.
                            drop(conn);
                            return Err(Failure::Fatal(DnsError::IdMismatch));
                        }
                        tracing::debug!(
                            tag = %self.tag,
                            addr = %self.addr,
                            "discarding stale reply from a previous exchange"
                        );
                        continue;
                    }

                    self.pool.put(conn);
                    codec::set_msg_id(original_id, &mut reply);
                    return Ok(reply);
                }
                Err(err) => return Err(self.settle_io_error(conn, is_new, err, ctx)),
            }
        }
    }

    async fn exchange_inner(
        &self,
        ctx: &CancellationToken,
        query: &[u8],
    ) -> DnsResult<PooledBuffer> {
        let mut force_new = false;
        loop {
            match self.exchange_once(ctx, query, force_new).await {
                Ok(reply) => return Ok(reply),
                Err(Failure::Retry(err)) if !force_new => {
                    tracing::warn!(
                        tag = %self.tag,
                        addr = %self.addr,
                        error = %err,
                        "i/o error on reused connection, retrying on a fresh one"
                    );
                    force_new = true;
                }
                Err(failure) => return Err(failure.into_error()),
            }
        }
    }
}

#[async_trait]
impl Upstream for StreamUpstream {
    async fn exchange(
        &self,
        ctx: &CancellationToken,
        query: &[u8],
    ) -> DnsResult<(PooledBuffer, Duration)> {
        let start = Instant::now();
        let reply = self.exchange_inner(ctx, query).await?;
        Ok((reply, start.elapsed()))
    }
}

fn parse_addr(config: &UpstreamConfig) -> DnsResult<SocketAddr> {
    config.addr.parse().map_err(|e| {
        DnsError::config_field(
            format!("invalid upstream address '{}': {e}", config.addr),
            "addr",
        )
    })
}
