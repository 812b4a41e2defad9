//! Error types for the upstream client
//!
//! This module defines the error hierarchy for DNS upstream exchanges,
//! covering cancellation, wire-format violations, network I/O, TLS, and
//! HTTP-level failures.
//!
//! # Recoverability
//!
//! Errors are classified as either recoverable or non-recoverable:
//! - **Recoverable**: transient I/O issues that may succeed on a fresh
//!   connection (timeouts, network errors)
//! - **Non-recoverable**: protocol or configuration violations that a retry
//!   cannot fix (ID mismatch on a new connection, oversized frames, bad
//!   config)
//!
//! # Example
//!
//! ```
//! use dns_upstream::DnsError;
//!
//! let err = DnsError::timeout("TCP connection to 8.8.8.8:53", std::time::Duration::from_secs(2));
//! assert!(err.is_recoverable());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error type for DNS upstream exchanges
#[derive(Debug, Error)]
pub enum DnsError {
    /// The caller cancelled the exchange
    ///
    /// Returned when the cancellation token was triggered before or during
    /// the exchange. The connection is recycled when its framing state is
    /// still known, closed otherwise.
    #[error("exchange cancelled")]
    Cancelled,

    /// A message shorter than the 12-byte DNS header was seen
    ///
    /// Applies to both the caller's query and an upstream's reply.
    #[error("message shorter than the DNS header")]
    ShortRead,

    /// The reply's transaction ID did not match the query's
    ///
    /// On a new stream connection or on a DoH reply this is a protocol
    /// error; on a reused stream connection a mismatch is consumed silently
    /// as a stale frame and never surfaces as this error.
    #[error("reply transaction id mismatch")]
    IdMismatch,

    /// A frame larger than the DNS maximum message size was announced
    #[error("frame of {len} bytes exceeds the DNS maximum message size")]
    FrameTooLarge {
        /// The announced frame length
        len: usize,
    },

    /// The TLS handshake with the upstream failed
    #[error("TLS handshake failed: {reason}")]
    TlsHandshake {
        /// Description of the handshake failure
        reason: String,
    },

    /// Network I/O error
    ///
    /// Wraps dial failures, connection resets, and read/write errors.
    #[error("network error: {reason}")]
    Network {
        /// Description of the network failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// An I/O operation exceeded its deadline
    #[error("{context} timed out after {timeout:?}")]
    Timeout {
        /// Description of what timed out
        context: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// A DoH upstream answered with a non-200 status
    #[error("unexpected HTTP status {status}")]
    HttpStatus {
        /// The HTTP status code received
        status: u16,
    },

    /// A DoH response body exceeded the DNS maximum message size
    #[error("HTTP body of {len} bytes exceeds the DNS maximum message size")]
    HttpBodyTooLarge {
        /// The advertised or observed body length
        len: u64,
    },

    /// Invalid upstream configuration
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of the configuration error
        reason: String,
        /// The configuration field at fault, if applicable
        field: Option<String>,
    },

    /// The configured protocol tag is not supported
    #[error("unsupported protocol: {protocol}")]
    UnsupportedProtocol {
        /// The offending protocol tag
        protocol: String,
    },
}

/// Result alias for DNS upstream operations
pub type DnsResult<T> = Result<T, DnsError>;

impl DnsError {
    /// Create a network error without an underlying I/O error
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error wrapping an I/O error
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            timeout,
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the field at fault
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create a TLS handshake error
    pub fn tls_handshake(reason: impl std::fmt::Display) -> Self {
        Self::TlsHandshake {
            reason: reason.to_string(),
        }
    }

    /// Whether a retry on a fresh connection could plausibly succeed
    ///
    /// Only transient transport failures qualify; protocol and
    /// configuration errors do not.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    /// Whether this error is the caller's cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
