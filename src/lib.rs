//! dns-upstream: multi-protocol DNS upstream client
//!
//! This crate ships a DNS query wire-message to a remote resolver over one
//! of four transports — plain UDP, plain TCP, DNS-over-TLS (RFC 7858), or
//! DNS-over-HTTPS (RFC 8484) — and returns the resolver's wire-message
//! reply. Messages are opaque byte sequences to this crate; only the
//! 16-bit transaction ID in the header is ever inspected or rewritten, and
//! the caller's ID is always restored on the reply.
//!
//! # Features
//!
//! - **Connection pooling**: long-lived stream connections (including
//!   connected UDP sockets) are cached LIFO per upstream with TTL eviction
//! - **Cancellation**: every exchange takes a `CancellationToken` and
//!   aborts promptly when it fires, without leaking sockets
//! - **Stale-reply tolerance**: a late answer to an earlier query on a
//!   reused connection is consumed and discarded, not returned
//! - **Single retry**: the first I/O failure on a reused connection
//!   triggers exactly one redial before surfacing
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Upstream   │ (trait)
//!                      └──────┬───────┘
//!               ┌─────────────┴─────────────┐
//!        ┌──────┴─────────┐         ┌───────┴─────┐
//!        │ StreamUpstream │         │ DohUpstream │
//!        │ (udp/tcp/dot)  │         │ (RFC 8484)  │
//!        └──────┬─────────┘         └───────┬─────┘
//!         ┌─────┴────┐                ┌─────┴─────┐
//!         │ ConnPool │                │   hyper   │
//!         │  (LIFO)  │                │ (h2/h1.1) │
//!         └──────────┘                └───────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use dns_upstream::{new_upstream, UpstreamConfig, UpstreamProtocol};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UpstreamConfig::new("cloudflare", "1.1.1.1:853", UpstreamProtocol::Dot)
//!     .with_server_name("cloudflare-dns.com");
//! let upstream = new_upstream(&config, None)?;
//!
//! let query: Vec<u8> = vec![/* a DNS wire-message, >= 12 bytes */];
//! let ctx = CancellationToken::new();
//! let (reply, rtt) = upstream.exchange(&ctx, &query).await?;
//! println!("answered in {rtt:?}, {} bytes", reply.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`buffer`]: pooled wire-message buffers
//! - [`codec`]: framed I/O and transaction-ID helpers
//! - [`config`]: upstream configuration types
//! - [`error`]: error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;

mod doh;
mod pool;
mod stream;
mod tls;
mod upstream;

pub use buffer::{MsgBufferPool, PooledBuffer};
pub use codec::{msg_id, set_msg_id, swap_msg_id, FrameState, DNS_HEADER_LEN, DNS_MAX_MSG_SIZE};
pub use config::{DohConfig, DotConfig, TcpConfig, UpstreamConfig, UpstreamProtocol};
pub use doh::DohUpstream;
pub use error::{DnsError, DnsResult};
pub use stream::StreamUpstream;
pub use upstream::{new_upstream, Upstream};
