//! The upstream capability and its factory
//!
//! Every transport exposes the same single operation: hand a DNS
//! wire-message to the resolver, get the resolver's wire-message back,
//! together with the wall-clock round-trip time. [`new_upstream`] picks the
//! implementation from the configured protocol tag.
//!
//! # Example
//!
//! ```no_run
//! use dns_upstream::{new_upstream, UpstreamConfig, UpstreamProtocol};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UpstreamConfig::new("google", "8.8.8.8:53", UpstreamProtocol::Udp);
//! let upstream = new_upstream(&config, None)?;
//!
//! let query: Vec<u8> = todo!("a DNS wire-message of at least 12 bytes");
//! let ctx = CancellationToken::new();
//! let (reply, rtt) = upstream.exchange(&ctx, &query).await?;
//! println!("{} bytes in {:?}", reply.len(), rtt);
//! # Ok(())
//! # }
//! ```

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::RootCertStore;
use tokio_util::sync::CancellationToken;

use crate::buffer::PooledBuffer;
use crate::config::{UpstreamConfig, UpstreamProtocol};
use crate::doh::DohUpstream;
use crate::error::{DnsError, DnsResult};
use crate::stream::StreamUpstream;

/// A DNS upstream resolver reachable over one transport
///
/// Implementations are `Send + Sync` and shared behind an [`Arc`]; every
/// call to [`exchange`](Upstream::exchange) is an independent query.
#[async_trait]
pub trait Upstream: Send + Sync + Debug {
    /// Send one DNS wire-message and await the resolver's reply
    ///
    /// `query` must be an intact DNS message of at least 12 bytes; it is
    /// never mutated. The returned reply carries the caller's original
    /// transaction ID regardless of what was put on the wire. The duration
    /// is the wall time of the whole call, dialing included.
    ///
    /// Cancelling `ctx` aborts the exchange promptly with
    /// [`DnsError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns an error when the query is malformed, the transport fails
    /// beyond the internal single retry, the reply violates the protocol,
    /// or the exchange is cancelled.
    async fn exchange(
        &self,
        ctx: &CancellationToken,
        query: &[u8],
    ) -> DnsResult<(PooledBuffer, Duration)>;
}

/// Build the upstream for a configuration
///
/// Dispatches on `config.protocol`; an empty tag deserializes as UDP.
///
/// `root_cas` injects TLS trust anchors for DoT and DoH; when `None`, the
/// bundled webpki roots are used.
///
/// # Errors
///
/// Returns a configuration error for unparsable addresses, a missing DoT
/// server name or DoH URL, and [`DnsError::UnsupportedProtocol`] for
/// protocol tags this crate does not implement.
pub fn new_upstream(
    config: &UpstreamConfig,
    root_cas: Option<RootCertStore>,
) -> DnsResult<Arc<dyn Upstream>> {
    match config.protocol {
        UpstreamProtocol::Udp => Ok(Arc::new(StreamUpstream::udp(config)?)),
        UpstreamProtocol::Tcp => Ok(Arc::new(StreamUpstream::tcp(config)?)),
        UpstreamProtocol::Dot => Ok(Arc::new(StreamUpstream::dot(config, root_cas)?)),
        UpstreamProtocol::Doh => {
            if config.doh.url.is_empty() {
                return Err(DnsError::config_field(
                    format!("protocol [{}] needs a URL", config.protocol.as_str()),
                    "doh.url",
                ));
            }
            Ok(Arc::new(DohUpstream::new(config, root_cas)?))
        }
        UpstreamProtocol::Doq => Err(DnsError::UnsupportedProtocol {
            protocol: config.protocol.as_str().to_string(),
        }),
    }
}
