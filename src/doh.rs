//! DNS-over-HTTPS upstream (RFC 8484)
//!
//! Queries go out as `GET <url>?dns=<base64url>` with the transaction ID
//! zeroed on the wire for cache friendliness (RFC 8484 §4.1); the caller's
//! ID is restored on the reply. The base64url value carries no padding
//! (RFC 8484 §6).
//!
//! Two HTTP engines sit behind the `doh.fasthttp` flag:
//!
//! - **default**: negotiates HTTP/2 via ALPN with HTTP/1.1 fallback, keeps
//!   idle connections for a minute, bounds the wait for response headers,
//!   and honors the caller's cancellation token.
//! - **fast**: HTTP/1.1 only with short static I/O timeouts. It does not
//!   observe the cancellation token mid-flight; its timeouts are the only
//!   bound. Lighter on CPU for busy single-host setups.
//!
//! Both dial the configured upstream address for every connection; the URL
//! hostname only provides SNI and the `Host` header.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Empty, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tower_service::Service;

use crate::buffer::{MsgBufferPool, PooledBuffer};
use crate::codec::{self, DNS_HEADER_LEN, DNS_MAX_MSG_SIZE};
use crate::config::UpstreamConfig;
use crate::error::{DnsError, DnsResult};
use crate::stream::{DIAL_TIMEOUT, TLS_HANDSHAKE_TIMEOUT};
use crate::tls;
use crate::upstream::Upstream;

/// Media type for DNS wire format over HTTPS
const DOH_CONTENT_TYPE: &str = "application/dns-message";

/// Static read/write timeout of the fast engine
const FAST_IO_TIMEOUT: Duration = Duration::from_secs(3);

/// Idle-connection timeout of the fast engine
const FAST_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the default engine waits for response headers
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle-connection timeout of the default engine
const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(60);

/// DNS-over-HTTPS upstream
///
/// # Example
///
/// ```no_run
/// use dns_upstream::{DohUpstream, UpstreamConfig, UpstreamProtocol};
///
/// let config = UpstreamConfig::new("cloudflare", "1.1.1.1:443", UpstreamProtocol::Doh)
///     .with_doh_url("https://cloudflare-dns.com/dns-query");
/// let upstream = DohUpstream::new(&config, None).expect("valid config");
/// assert!(upstream.prepared_url().ends_with("?dns="));
/// ```
pub struct DohUpstream {
    tag: String,
    prepared_url: String,
    fast: bool,
    client: Client<FixedAddrConnector, Empty<Bytes>>,
    buffers: Arc<MsgBufferPool>,
}

impl std::fmt::Debug for DohUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohUpstream")
            .field("tag", &self.tag)
            .field("prepared_url", &self.prepared_url)
            .field("fast", &self.fast)
            .finish()
    }
}

impl DohUpstream {
    /// Create a DoH upstream
    ///
    /// The URL must use the `https` scheme. `config.addr` is the address
    /// every connection dials. `root_cas` injects trust anchors; the
    /// bundled webpki roots are used when `None`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a non-https or unparsable URL, or
    /// an unparsable address.
    pub fn new(config: &UpstreamConfig, root_cas: Option<RootCertStore>) -> DnsResult<Self> {
        let prepared_url = prepare_url(&config.doh.url)?;

        let addr: SocketAddr = config.addr.parse().map_err(|e| {
            DnsError::config_field(
                format!("invalid upstream address '{}': {e}", config.addr),
                "addr",
            )
        })?;

        let fast = config.doh.fasthttp;
        let alpn: &[&[u8]] = if fast {
            &[b"http/1.1"]
        } else {
            &[b"h2", b"http/1.1"]
        };
        let tls_config = tls::client_config(root_cas, config.insecure_skip_verify, alpn);
        let connector = FixedAddrConnector {
            addr,
            tls: TlsConnector::from(Arc::new(tls_config)),
        };

        let idle = if fast { FAST_IDLE_TIMEOUT } else { IDLE_CONN_TIMEOUT };
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(idle)
            .build::<_, Empty<Bytes>>(connector);

        Ok(Self {
            tag: config.tag.clone(),
            prepared_url,
            fast,
            client,
            buffers: Arc::new(MsgBufferPool::with_defaults()),
        })
    }

    /// The normalized URL prefix queries are appended to
    ///
    /// Always ends in `?dns=` or `&dns=`.
    #[must_use]
    pub fn prepared_url(&self) -> &str {
        &self.prepared_url
    }

    /// Build the request URL for an already-ID-zeroed query.
    fn query_url(&self, msg: &[u8]) -> String {
        let mut url = String::with_capacity(self.prepared_url.len() + (msg.len() * 4 + 2) / 3);
        url.push_str(&self.prepared_url);
        URL_SAFE_NO_PAD.encode_string(msg, &mut url);
        url
    }

    fn build_request(&self, url: &str) -> DnsResult<Request<Empty<Bytes>>> {
        Request::builder()
            .method(Method::GET)
            .uri(url)
            .header(header::ACCEPT, DOH_CONTENT_TYPE)
            .body(Empty::new())
            .map_err(|e| DnsError::network(format!("failed to build DoH request: {e}")))
    }

    async fn do_default(&self, ctx: &CancellationToken, url: &str) -> DnsResult<Bytes> {
        let request = self.build_request(url)?;

        let response = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(DnsError::Cancelled),
            res = timeout(RESPONSE_HEADER_TIMEOUT, self.client.request(request)) => {
                res.map_err(|_| {
                    DnsError::timeout("DoH response headers", RESPONSE_HEADER_TIMEOUT)
                })?
                .map_err(|e| DnsError::network(format!("DoH request failed: {e}")))?
            }
        };
        check_response(&response)?;

        tokio::select! {
            biased;
            () = ctx.cancelled() => Err(DnsError::Cancelled),
            res = read_body(response) => res,
        }
    }

    async fn do_fast(&self, url: &str) -> DnsResult<Bytes> {
        let request = self.build_request(url)?;

        let response = timeout(FAST_IO_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| DnsError::timeout("DoH request", FAST_IO_TIMEOUT))?
            .map_err(|e| DnsError::network(format!("DoH request failed: {e}")))?;
        check_response(&response)?;

        timeout(FAST_IO_TIMEOUT, read_body(response))
            .await
            .map_err(|_| DnsError::timeout("DoH response body", FAST_IO_TIMEOUT))?
    }

    async fn exchange_inner(
        &self,
        ctx: &CancellationToken,
        query: &[u8],
    ) -> DnsResult<PooledBuffer> {
        if query.len() < DNS_HEADER_LEN {
            return Err(DnsError::ShortRead);
        }

        // ID goes out as zero (RFC 8484 4.1); the swap happens on a copy.
        let mut qbuf = self.buffers.acquire_copy(query);
        let original_id = codec::swap_msg_id(0, &mut qbuf);
        let url = self.query_url(&qbuf);

        let body = if self.fast {
            self.do_fast(&url).await?
        } else {
            self.do_default(ctx, &url).await?
        };

        if body.len() < DNS_HEADER_LEN {
            return Err(DnsError::ShortRead);
        }
        let mut reply = self.buffers.acquire_copy(&body);
        if codec::msg_id(&reply) != 0 {
            tracing::debug!(tag = %self.tag, "DoH reply carried a non-zero transaction id");
            return Err(DnsError::IdMismatch);
        }
        codec::set_msg_id(original_id, &mut reply);
        Ok(reply)
    }
}

#[async_trait]
impl Upstream for DohUpstream {
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

/// Normalize a DoH URL so the `dns` parameter can be appended directly.
fn prepare_url(url: &str) -> DnsResult<String> {
    let uri: Uri = url.parse().map_err(|e| {
        DnsError::config_field(format!("invalid DoH URL '{url}': {e}"), "doh.url")
    })?;

    if uri.scheme_str() != Some("https") {
        return Err(DnsError::config_field(
            format!(
                "DoH URL must use the https scheme, got '{}'",
                uri.scheme_str().unwrap_or("")
            ),
            "doh.url",
        ));
    }

    let mut prepared = String::from(url);
    match uri.query() {
        None => prepared.push_str("?dns="),
        // a bare trailing '?' already opens the query string
        Some("") => prepared.push_str("dns="),
        Some(_) => prepared.push_str("&dns="),
    }
    Ok(prepared)
}

/// Reject replies that cannot be a DNS message before touching the body.
fn check_response(response: &Response<Incoming>) -> DnsResult<()> {
    if let Some(len) = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
    {
        if len > DNS_MAX_MSG_SIZE as u64 {
            return Err(DnsError::HttpBodyTooLarge { len });
        }
    }

    let status = response.status();
    if status != StatusCode::OK {
        return Err(DnsError::HttpStatus {
            status: status.as_u16(),
        });
    }
    Ok(())
}

/// Collect the response body, bounded by the DNS maximum message size.
async fn read_body(response: Response<Incoming>) -> DnsResult<Bytes> {
    let limited = Limited::new(response.into_body(), DNS_MAX_MSG_SIZE);
    let collected = limited.collect().await.map_err(|e| {
        if e.downcast_ref::<LengthLimitError>().is_some() {
            DnsError::HttpBodyTooLarge {
                len: DNS_MAX_MSG_SIZE as u64 + 1,
            }
        } else {
            DnsError::network(format!("failed to read DoH response body: {e}"))
        }
    })?;
    Ok(collected.to_bytes())
}

/// Connector that always dials the configured upstream address
///
/// The request URI's host is used for SNI only.
#[derive(Clone)]
struct FixedAddrConnector {
    addr: SocketAddr,
    tls: TlsConnector,
}

impl Service<Uri> for FixedAddrConnector {
    type Response = DohConnection;
    type Error = DnsError;
    type Future = Pin<Box<dyn Future<Output = Result<DohConnection, DnsError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            let host = dst.host().unwrap_or_default().to_string();
            let server_name: ServerName<'static> = host.clone().try_into().map_err(|_| {
                DnsError::config_field(format!("invalid TLS server name '{host}'"), "doh.url")
            })?;

            let tcp = timeout(DIAL_TIMEOUT, TcpStream::connect(connector.addr))
                .await
                .map_err(|_| {
                    DnsError::timeout(
                        format!("TCP connection to {}", connector.addr),
                        DIAL_TIMEOUT,
                    )
                })?
                .map_err(|e| {
                    DnsError::network_io(format!("failed to connect to {}", connector.addr), e)
                })?;
            tcp.set_nodelay(true).ok();

            let tls_stream = timeout(
                TLS_HANDSHAKE_TIMEOUT,
                connector.tls.connect(server_name, tcp),
            )
            .await
            .map_err(|_| DnsError::timeout("TLS handshake", TLS_HANDSHAKE_TIMEOUT))?
            .map_err(DnsError::tls_handshake)?;

            let h2 = tls_stream.get_ref().1.alpn_protocol() == Some(&b"h2"[..]);
            Ok(DohConnection {
                io: TokioIo::new(tls_stream),
                h2,
            })
        })
    }
}

/// An established DoH connection handed to the HTTP client
struct DohConnection {
    io: TokioIo<TlsStream<TcpStream>>,
    h2: bool,
}

impl Read for DohConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl Write for DohConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl Connection for DohConnection {
    fn connected(&self) -> Connected {
        let connected = Connected::new();
        if self.h2 {
            connected.negotiated_h2()
        } else {
            connected
        }
    }
}
