//! Tunnel agent errors

use excalibur_pki::PkiError;
use excalibur_transport::TransportError;

/// Result type for tunnel agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised while starting or running the tunnel agent
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A command line option or required environment value is invalid
    #[error("invalid option --{field}: {message}")]
    Validation {
        /// Flag or variable name
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// Kubernetes, discovery or hook failure
    #[error(transparent)]
    Common(#[from] excalibur_common::Error),

    /// Certificate failure
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// Tunnel protocol failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The tunnel server could not be reached
    #[error("failed to connect to tunnel server {addr}: {message}")]
    Connect {
        /// Server address
        addr: String,
        /// What went wrong
        message: String,
    },
}

impl AgentError {
    /// Create a validation error for `field`
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a connection error for `addr`
    pub fn connect(addr: impl ToString, message: impl Into<String>) -> Self {
        Self::Connect {
            addr: addr.to_string(),
            message: message.into(),
        }
    }
}
