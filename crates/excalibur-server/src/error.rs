//! Tunnel server errors

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use excalibur_pki::PkiError;
use excalibur_transport::TransportError;

/// Result type for tunnel server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors raised while starting or running the tunnel server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A command line option is invalid
    #[error("invalid option --{field}: {message}")]
    Validation {
        /// Flag name
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

    /// A listener could not be bound
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// No connected agent can serve a destination
    #[error("no agent available for {0}")]
    NoAgent(String),

    /// Upstream request failed
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Create a validation error for `field`
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a bind error for a socket address
    pub fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::NoAgent(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Proxy(_) | ServerError::Transport(_) => StatusCode::BAD_GATEWAY,
            ServerError::Validation { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(e: reqwest::Error) -> Self {
        ServerError::Proxy(e.to_string())
    }
}
