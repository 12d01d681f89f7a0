// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.
//!
//! One sectioned enum covers everything from bind-time failures to
//! per-delivery type mismatches. Transient network errors are never
//! surfaced through this type; they are logged and absorbed by
//! discovery re-advertisements.

use std::fmt;
use std::io;

/// Errors returned by meshbus operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Setup errors (fatal at startup)
    // ========================================================================
    /// Failed to bind a socket at runtime construction.
    BindFailure(String),
    /// Generic I/O error with underlying cause.
    IoError(io::Error),

    // ========================================================================
    // Wire errors (per-datagram / per-frame, callers drop and continue)
    // ========================================================================
    /// A discovery datagram could not be parsed.
    DiscoveryParseError(String),
    /// A TCP frame could not be parsed.
    FrameParseError(String),

    // ========================================================================
    // Data errors
    // ========================================================================
    /// Payload type does not match the declared type descriptor.
    TypeMismatch,
    /// Payload bytes could not be decoded into the expected type.
    DecodeError(String),
    /// A value could not be encoded.
    EncodeError(String),

    // ========================================================================
    // Operation errors
    // ========================================================================
    /// Topic name is empty or contains reserved characters.
    InvalidTopic(String),
    /// Publish on a topic this node never advertised.
    NotAdvertised(String),
    /// Send on an established connection failed.
    SendFailed(String),
    /// Could not reach a peer's control endpoint.
    PeerUnreachable(String),
    /// The service handler reported failure.
    ServiceFailure,
    /// A service call did not complete within its deadline.
    Timeout,
    /// The runtime is shutting down; no new operations are accepted.
    ShutdownInProgress,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Setup
            Error::BindFailure(msg) => write!(f, "Bind failed: {}", msg),
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            // Wire
            Error::DiscoveryParseError(msg) => write!(f, "Discovery parse error: {}", msg),
            Error::FrameParseError(msg) => write!(f, "Frame parse error: {}", msg),
            // Data
            Error::TypeMismatch => write!(f, "Type mismatch"),
            Error::DecodeError(msg) => write!(f, "Decode error: {}", msg),
            Error::EncodeError(msg) => write!(f, "Encode error: {}", msg),
            // Operations
            Error::InvalidTopic(topic) => write!(f, "Invalid topic [{}]", topic),
            Error::NotAdvertised(topic) => write!(f, "Topic [{}] not advertised", topic),
            Error::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            Error::PeerUnreachable(addr) => write!(f, "Peer unreachable: {}", addr),
            Error::ServiceFailure => write!(f, "Service handler reported failure"),
            Error::Timeout => write!(f, "Request timed out"),
            Error::ShutdownInProgress => write!(f, "Shutdown in progress"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e)
    }
}

/// Convenient alias for API results using the public `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_covers_interesting_variants() {
        let e = Error::InvalidTopic("a topic".to_string());
        assert!(e.to_string().contains("a topic"));

        let e = Error::NotAdvertised("/foo".to_string());
        assert!(e.to_string().contains("/foo"));

        let e: Error = io::Error::new(io::ErrorKind::AddrInUse, "in use").into();
        assert!(matches!(e, Error::IoError(_)));
        assert!(e.to_string().contains("in use"));
    }

    #[test]
    fn io_error_has_source() {
        use std::error::Error as _;
        let e = Error::IoError(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(e.source().is_some());
        assert!(Error::Timeout.source().is_none());
    }
}
