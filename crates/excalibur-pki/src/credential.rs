//! Signed credentials
//!
//! A [`Credential`] is an immutable key + certificate chain. Rotation builds
//! a new one and swaps it in; nothing is mutated in place.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer};
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::{PkiError, Result};

/// Anything that can hand out the current credential
///
/// Lookups never block; `None` means no certificate has been signed yet.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
pub trait CredentialSource: Send + Sync {
    /// Most recently accepted credential
    fn current(&self) -> Option<Arc<Credential>>;
}

/// Private key and signed certificate chain
pub struct Credential {
    cert_chain_pem: String,
    key_pem: Zeroizing<String>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    common_name: String,
    organizations: Vec<String>,
    certified_key: Arc<CertifiedKey>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("common_name", &self.common_name)
            .field("organizations", &self.organizations)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// Build a credential from a PEM certificate chain and PEM private key
    ///
    /// The leaf must be first in the chain and must match the key.
    pub fn from_pem(cert_chain_pem: &str, key_pem: Zeroizing<String>) -> Result<Self> {
        let chain: Vec<CertificateDer<'static>> = ::pem::parse_many(cert_chain_pem.as_bytes())
            .map_err(|e| PkiError::Parse(format!("failed to parse certificate PEM: {}", e)))?
            .into_iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| CertificateDer::from(block.into_contents()))
            .collect();
        let leaf = chain
            .first()
            .ok_or_else(|| PkiError::Parse("no certificate in PEM".to_string()))?;

        let (_, cert) = X509Certificate::from_der(leaf.as_ref())
            .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {}", e)))?;

        let key_pair = rcgen::KeyPair::from_pem(&key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse private key: {}", e)))?;
        if key_pair.public_key_raw() != cert.public_key().subject_public_key.data.as_ref() {
            return Err(PkiError::KeyMismatch);
        }

        let not_before = asn1_to_chrono(cert.validity().not_before)?;
        let not_after = asn1_to_chrono(cert.validity().not_after)?;
        let subject = cert.subject();
        let common_name = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let organizations = subject
            .iter_organization()
            .filter_map(|o| o.as_str().ok().map(str::to_string))
            .collect();

        let key_der = private_key_der(&key_pem)?;
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key_der)
            .map_err(|e| PkiError::Parse(format!("unsupported private key: {}", e)))?;
        let certified_key = Arc::new(CertifiedKey::new(chain, signing_key));

        Ok(Self {
            cert_chain_pem: cert_chain_pem.to_string(),
            key_pem,
            not_before,
            not_after,
            common_name,
            organizations,
            certified_key,
        })
    }

    /// Build a credential from a single PEM bundle holding chain and key
    pub fn from_bundle(bundle: &str) -> Result<Self> {
        let blocks = ::pem::parse_many(bundle.as_bytes())
            .map_err(|e| PkiError::Parse(format!("failed to parse PEM bundle: {}", e)))?;

        let mut certs = String::new();
        let mut key: Option<Zeroizing<String>> = None;
        for block in blocks {
            if block.tag() == "CERTIFICATE" {
                certs.push_str(&::pem::encode(&block));
            } else if block.tag().ends_with("PRIVATE KEY") {
                key = Some(Zeroizing::new(::pem::encode(&block)));
            }
        }
        let key = key.ok_or_else(|| PkiError::Parse("no private key in PEM bundle".to_string()))?;
        Self::from_pem(&certs, key)
    }

    /// Certificate chain followed by the private key, as written to disk
    pub fn to_bundle(&self) -> Zeroizing<String> {
        let mut bundle = Zeroizing::new(String::with_capacity(
            self.cert_chain_pem.len() + self.key_pem.len() + 1,
        ));
        bundle.push_str(&self.cert_chain_pem);
        if !bundle.ends_with('\n') {
            bundle.push('\n');
        }
        bundle.push_str(&self.key_pem);
        bundle
    }

    /// PEM certificate chain, leaf first
    pub fn cert_chain_pem(&self) -> &str {
        &self.cert_chain_pem
    }

    /// PEM private key
    pub fn key_pem(&self) -> &Zeroizing<String> {
        &self.key_pem
    }

    /// Start of validity
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// Expiry
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Subject common name
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Subject organizations
    pub fn organizations(&self) -> &[String] {
        &self.organizations
    }

    /// Whether `now` lies inside the validity window
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    /// rustls signing material for handshakes
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }
}

fn asn1_to_chrono(time: ASN1Time) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(time.timestamp(), 0)
        .single()
        .ok_or_else(|| PkiError::Parse(format!("certificate time out of range: {}", time)))
}

fn private_key_der(key_pem: &str) -> Result<PrivateKeyDer<'static>> {
    let block = ::pem::parse(key_pem.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse private key PEM: {}", e)))?;
    let der = block.contents().to_vec();
    match block.tag() {
        "PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der))),
        "EC PRIVATE KEY" => Ok(PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(der))),
        "RSA PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der))),
        other => Err(PkiError::Parse(format!("unexpected key block {}", other))),
    }
}

/// Test helpers: a throwaway CA that signs CSRs the way the cluster signer does
#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use rcgen::{
        BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
        DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
    };
    use zeroize::Zeroizing;

    use super::Credential;
    use crate::template::{generate_key, IdentityTemplate};

    /// Self-signed CA for tests
    pub struct TestCa {
        cert_pem: String,
        key: KeyPair,
    }

    impl TestCa {
        /// Create a CA named `common_name`
        pub fn new(common_name: &str) -> Self {
            let key = KeyPair::generate().expect("CA key");
            let mut params = CertificateParams::default();
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
            params.distinguished_name = dn;
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
            let cert = params.self_signed(&key).expect("CA cert");
            Self {
                cert_pem: cert.pem(),
                key,
            }
        }

        /// CA certificate PEM
        pub fn cert_pem(&self) -> &str {
            &self.cert_pem
        }

        /// Sign `csr_pem`, valid for `lifetime` starting now
        pub fn sign(&self, csr_pem: &str, lifetime: std::time::Duration) -> String {
            let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).expect("CSR");
            let now = time::OffsetDateTime::now_utc();
            csr.params.not_before = now - time::Duration::minutes(1);
            csr.params.not_after = now + lifetime;
            csr.params.is_ca = IsCa::NoCa;
            csr.params.extended_key_usages = vec![
                ExtendedKeyUsagePurpose::ClientAuth,
                ExtendedKeyUsagePurpose::ServerAuth,
            ];
            let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &self.key).expect("issuer");
            csr.signed_by(&issuer).expect("sign").pem()
        }

        /// Issue a full credential for `template`
        pub fn issue(&self, template: &IdentityTemplate, lifetime: std::time::Duration) -> Credential {
            let key = generate_key().expect("key");
            let csr = template.to_csr_pem(&key).expect("CSR");
            let cert = self.sign(&csr, lifetime);
            Credential::from_pem(&cert, Zeroizing::new(key.serialize_pem())).expect("credential")
        }
    }
}
