//! rustls configuration derived from the current credential
//!
//! Certificates are resolved per handshake, so a rotation takes effect on
//! the next connection without rebuilding any config.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SignatureScheme};
use tracing::debug;

use crate::credential::CredentialSource;
use crate::{PkiError, Result};

/// Load the PEM bundle at `path` into a root store
pub fn load_root_store(path: impl AsRef<Path>) -> Result<RootCertStore> {
    let path = path.as_ref();
    let bundle = std::fs::read(path).map_err(|e| PkiError::store(path, e))?;
    root_store_from_pem(&bundle)
}

/// Build a root store from every certificate in a PEM bundle
pub fn root_store_from_pem(bundle: impl AsRef<[u8]>) -> Result<RootCertStore> {
    let blocks = ::pem::parse_many(bundle)
        .map_err(|e| PkiError::Parse(format!("invalid CA bundle: {}", e)))?;

    let mut roots = RootCertStore::empty();
    for block in blocks
        .into_iter()
        .filter(|b| b.tag() == "CERTIFICATE")
    {
        roots.add(CertificateDer::from(block.into_contents()))?;
    }
    if roots.is_empty() {
        return Err(PkiError::Parse("CA bundle contains no certificates".to_string()));
    }
    Ok(roots)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Serves whatever certificate the source currently holds
#[derive(Clone)]
pub struct CurrentCertResolver {
    source: Arc<dyn CredentialSource>,
}

impl CurrentCertResolver {
    /// Create a resolver over `source`
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self { source }
    }

    fn resolve_current(&self) -> Option<Arc<CertifiedKey>> {
        let key = self.source.current().map(|c| c.certified_key());
        if key.is_none() {
            debug!("No credential available for handshake");
        }
        key
    }
}

impl fmt::Debug for CurrentCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurrentCertResolver")
            .field("has_credential", &self.source.current().is_some())
            .finish()
    }
}

impl ResolvesServerCert for CurrentCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.resolve_current()
    }
}

impl ResolvesClientCert for CurrentCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.resolve_current()
    }

    fn has_certs(&self) -> bool {
        self.source.current().is_some()
    }
}

/// How a server treats client certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// Handshake fails without a certificate chaining to the roots
    Require,
    /// A certificate is verified when offered but not demanded
    Request,
}

/// Trust roots plus the rotating local identity
#[derive(Clone)]
pub struct TransportSecurity {
    roots: Arc<RootCertStore>,
    resolver: Arc<CurrentCertResolver>,
}

impl TransportSecurity {
    /// Combine `roots` with the identity held by `source`
    pub fn new(roots: RootCertStore, source: Arc<dyn CredentialSource>) -> Self {
        Self {
            roots: Arc::new(roots),
            resolver: Arc::new(CurrentCertResolver::new(source)),
        }
    }

    /// Server config presenting the current certificate
    pub fn server_config(&self, client_auth: ClientAuth) -> Result<ServerConfig> {
        let provider = provider();
        let builder =
            WebPkiClientVerifier::builder_with_provider(Arc::clone(&self.roots), provider.clone());
        let verifier = match client_auth {
            ClientAuth::Require => builder.build(),
            ClientAuth::Request => builder.allow_unauthenticated().build(),
        }
        .map_err(|e| PkiError::Tls(format!("client verifier: {}", e)))?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(self.resolver.clone());
        Ok(config)
    }

    /// Client config presenting the current certificate and trusting the roots
    pub fn client_config(&self) -> Result<ClientConfig> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(Arc::clone(&self.roots))
            .with_client_cert_resolver(self.resolver.clone());
        Ok(config)
    }
}

impl fmt::Debug for TransportSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSecurity")
            .field("roots", &self.roots.len())
            .field("resolver", &self.resolver)
            .finish()
    }
}
