//! PKI errors

use thiserror::Error;

/// Errors raised while requesting, storing or using certificates
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Signing request could not be built
    #[error("invalid signing request: {0}")]
    InvalidCsr(String),

    /// Certificate or key material could not be parsed
    #[error("certificate parsing error: {0}")]
    Parse(String),

    /// The certificate does not belong to the private key
    #[error("certificate public key does not match private key")]
    KeyMismatch,

    /// Persisting or loading a credential failed
    #[error("credential store error at {path}: {message}")]
    Store {
        /// File or directory involved
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Signing request object does not exist
    #[error("signing request {0} not found")]
    NotFound(String),

    /// Signing request was denied
    #[error("signing request {name} was denied: {reason}")]
    Denied {
        /// Signing request name
        name: String,
        /// Reason recorded on the Denied condition
        reason: String,
    },

    /// Signer gave up on the signing request
    #[error("signing request {name} failed: {reason}")]
    Failed {
        /// Signing request name
        name: String,
        /// Reason recorded on the Failed condition
        reason: String,
    },

    /// No decision arrived in time
    #[error("timed out waiting for signing request {0}")]
    Timeout(String),

    /// Signing authority call failed
    #[error("signing authority error: {0}")]
    Authority(#[from] kube::Error),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

impl PkiError {
    /// Create a store error for `path`
    pub fn store(path: impl AsRef<std::path::Path>, msg: impl std::fmt::Display) -> Self {
        Self::Store {
            path: path.as_ref().display().to_string(),
            message: msg.to_string(),
        }
    }

    /// Whether the object is gone for good
    pub fn is_not_found(&self) -> bool {
        match self {
            PkiError::NotFound(_) => true,
            PkiError::Authority(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

impl From<rustls::Error> for PkiError {
    fn from(e: rustls::Error) -> Self {
        PkiError::Tls(e.to_string())
    }
}
