//! Upstream configuration types
//!
//! This module defines the configuration surface for a single upstream
//! resolver: which protocol to speak, the address every dial goes to, and
//! the per-protocol knobs (stream idle timeouts, TLS server name, DoH URL
//! and engine selection).
//!
//! # Example
//!
//! ```
//! use dns_upstream::{UpstreamConfig, UpstreamProtocol};
//!
//! let config = UpstreamConfig::new("cloudflare", "1.1.1.1:853", UpstreamProtocol::Dot)
//!     .with_server_name("cloudflare-dns.com");
//! assert_eq!(config.tag, "cloudflare");
//! assert_eq!(config.dot.server_name, "cloudflare-dns.com");
//! ```

use serde::{Deserialize, Serialize};

/// Default idle timeout for pooled stream connections, in seconds
fn default_idle_timeout() -> u64 {
    10
}

/// Protocol spoken to the upstream resolver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    /// Plain UDP (RFC 1035)
    ///
    /// The empty tag is accepted as an alias for backwards compatibility
    /// with configs that never set a protocol.
    #[default]
    #[serde(alias = "")]
    Udp,

    /// Plain TCP (RFC 1035)
    Tcp,

    /// DNS-over-TLS (RFC 7858)
    Dot,

    /// DNS-over-HTTPS (RFC 8484)
    Doh,

    /// DNS-over-QUIC (RFC 9250)
    ///
    /// Recognized in configs but not implemented; the factory rejects it.
    Doq,
}

impl UpstreamProtocol {
    /// The protocol tag as it appears in configuration files
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Dot => "dot",
            Self::Doh => "doh",
            Self::Doq => "doq",
        }
    }
}

/// Plain-TCP upstream options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Idle timeout in seconds for pooled connections
    ///
    /// Doubles as the pool TTL; the pool's cleaning interval is half of it.
    /// A value of 0 disables pooling (every query dials fresh).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// DNS-over-TLS upstream options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DotConfig {
    /// TLS server name, used for SNI and certificate verification
    #[serde(default)]
    pub server_name: String,

    /// Idle timeout in seconds for pooled connections
    ///
    /// Same semantics as [`TcpConfig::idle_timeout`].
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// DNS-over-HTTPS upstream options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DohConfig {
    /// Full HTTPS URL of the DoH endpoint
    ///
    /// The scheme must be `https`. The URL host is informational only;
    /// every dial goes to [`UpstreamConfig::addr`].
    #[serde(default)]
    pub url: String,

    /// Use the lighter HTTP/1.1 single-host engine instead of the default
    /// HTTP/2-capable client
    #[serde(default)]
    pub fasthttp: bool,
}

/// Configuration of one upstream resolver
///
/// # Example
///
/// ```
/// use dns_upstream::{UpstreamConfig, UpstreamProtocol};
///
/// let config = UpstreamConfig::new("google", "8.8.8.8:53", UpstreamProtocol::Udp);
/// assert_eq!(config.addr, "8.8.8.8:53");
/// assert!(!config.insecure_skip_verify);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Identifier used in logs
    #[serde(default)]
    pub tag: String,

    /// Protocol to speak to this upstream
    #[serde(default)]
    pub protocol: UpstreamProtocol,

    /// `host:port` literal address used for every dial
    ///
    /// For DoH this bypasses resolution of the URL hostname entirely.
    pub addr: String,

    /// Plain-TCP options
    #[serde(default)]
    pub tcp: TcpConfig,

    /// DNS-over-TLS options
    #[serde(default)]
    pub dot: DotConfig,

    /// DNS-over-HTTPS options
    #[serde(default)]
    pub doh: DohConfig,

    /// Disable TLS certificate verification
    ///
    /// Test-only. Never enable against a real resolver.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl UpstreamConfig {
    /// Create a configuration with the given tag, address and protocol
    #[must_use]
    pub fn new(tag: impl Into<String>, addr: impl Into<String>, protocol: UpstreamProtocol) -> Self {
        Self {
            tag: tag.into(),
            protocol,
            addr: addr.into(),
            tcp: TcpConfig::default(),
            dot: DotConfig::default(),
            doh: DohConfig::default(),
            insecure_skip_verify: false,
        }
    }

    /// Set the idle timeout (seconds) for both TCP and DoT pooling
    #[must_use]
    pub fn with_idle_timeout(mut self, secs: u64) -> Self {
        self.tcp.idle_timeout = secs;
        self.dot.idle_timeout = secs;
        self
    }

    /// Set the TLS server name for DoT
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.dot.server_name = name.into();
        self
    }

    /// Set the DoH endpoint URL
    #[must_use]
    pub fn with_doh_url(mut self, url: impl Into<String>) -> Self {
        self.doh.url = url.into();
        self
    }

    /// Select the lighter HTTP/1.1 DoH engine
    #[must_use]
    pub fn with_fasthttp(mut self, enabled: bool) -> Self {
        self.doh.fasthttp = enabled;
        self
    }
}
