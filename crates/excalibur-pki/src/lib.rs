//! Certificate bootstrap for the excalibur tunnel
//!
//! Every tunnel endpoint obtains its X.509 identity from the hub cluster's
//! signing authority before any traffic flows:
//!
//! - [`template`] describes the identity each role requests
//! - [`manager`] submits signing requests, waits for the signed certificate
//!   and keeps it rotated
//! - [`store`] holds the current credential (and persists it on disk)
//! - [`approver`] auto-approves signing requests scoped to the tunnel
//! - [`tls`] turns the current credential into rustls configurations

#![deny(missing_docs)]

pub mod approver;
pub mod authority;
pub mod credential;
pub mod error;
pub mod manager;
pub mod store;
pub mod template;
pub mod tls;

pub use credential::{Credential, CredentialSource};
pub use error::PkiError;
pub use manager::{wait_for_current, CertificateManager, CertificateManagerConfig};
pub use store::CredentialStore;
pub use template::IdentityTemplate;

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
