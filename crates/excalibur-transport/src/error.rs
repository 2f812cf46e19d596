//! Transport errors

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the tunnel protocol
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying connection failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame header names an unknown kind
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    /// Frame payload exceeds the protocol limit
    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Declared payload length
        len: usize,
        /// Maximum accepted payload length
        max: usize,
    },

    /// Peer did not complete the handshake
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Agent identifier string is malformed
    #[error("invalid agent identifier {entry:?}: {reason}")]
    InvalidIdentifier {
        /// Offending entry
        entry: String,
        /// What is wrong with it
        reason: String,
    },

    /// Peer could not reach the dial target
    #[error("dial to {target} failed: {reason}")]
    DialFailed {
        /// Requested `host:port`
        target: String,
        /// Reason reported by the peer
        reason: String,
    },

    /// Nothing was received within the idle timeout
    #[error("peer silent for {0:?}")]
    IdleTimeout(Duration),

    /// Session has shut down
    #[error("session closed")]
    Closed,
}

impl TransportError {
    /// Create an invalid identifier error
    pub fn invalid_identifier(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            entry: entry.into(),
            reason: reason.into(),
        }
    }
}
