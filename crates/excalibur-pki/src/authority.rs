//! Signing authority client
//!
//! The Kubernetes API server (certificates.k8s.io/v1) is the signing
//! authority. Everything the manager and approver need from it sits behind
//! [`SigningAuthority`] so both can be exercised without a cluster.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
};
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, trace};

use crate::{PkiError, Result};

/// Signer used when none is configured
pub const DEFAULT_SIGNER_NAME: &str = "kubernetes.io/kube-apiserver-client";

/// A signing request about to be submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    /// PEM-encoded PKCS#10 request
    pub csr_pem: String,
    /// Signer that should issue the certificate
    pub signer_name: String,
    /// Requested key usages
    pub usages: Vec<String>,
    /// Requested certificate lifetime, if any
    pub expiration_seconds: Option<i32>,
}

/// Outcome recorded on a signing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalState {
    /// No decision yet
    Pending,
    /// Approved by some actor
    Approved,
    /// Denied by some actor
    Denied,
}

/// Decision recorded on `csr`, if any
pub fn approval_state(csr: &CertificateSigningRequest) -> ApprovalState {
    let conditions = csr
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    if conditions.iter().any(|c| c.type_ == "Denied") {
        ApprovalState::Denied
    } else if conditions.iter().any(|c| c.type_ == "Approved") {
        ApprovalState::Approved
    } else {
        ApprovalState::Pending
    }
}

/// Operations the tunnel needs from the signing authority
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait SigningAuthority: Send + Sync {
    /// Submit a request; returns the server-assigned name
    async fn submit(&self, request: &SigningRequest) -> Result<String>;

    /// Fetch a request by name; `PkiError::NotFound` if it is gone
    async fn get(&self, name: &str) -> Result<CertificateSigningRequest>;

    /// Replace the approval conditions of `name`
    ///
    /// `resource_version` guards against writing over a decision that
    /// landed after the caller read the object.
    async fn patch_approval(
        &self,
        name: &str,
        resource_version: Option<String>,
        conditions: Vec<CertificateSigningRequestCondition>,
    ) -> Result<CertificateSigningRequest>;
}

/// [`SigningAuthority`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeSigningAuthority {
    api: Api<CertificateSigningRequest>,
}

impl KubeSigningAuthority {
    /// Use `client` to talk to the cluster signer
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl SigningAuthority for KubeSigningAuthority {
    async fn submit(&self, request: &SigningRequest) -> Result<String> {
        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                generate_name: Some("csr-".to_string()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request.csr_pem.as_bytes().to_vec()),
                signer_name: request.signer_name.clone(),
                usages: Some(request.usages.clone()),
                expiration_seconds: request.expiration_seconds,
                ..Default::default()
            },
            status: None,
        };

        let created = self.api.create(&PostParams::default(), &csr).await?;
        let name = created
            .metadata
            .name
            .ok_or_else(|| PkiError::InvalidCsr("created request has no name".to_string()))?;
        debug!(csr = %name, signer = %request.signer_name, "Submitted signing request");
        Ok(name)
    }

    async fn get(&self, name: &str) -> Result<CertificateSigningRequest> {
        self.api
            .get_opt(name)
            .await?
            .ok_or_else(|| PkiError::NotFound(name.to_string()))
    }

    async fn patch_approval(
        &self,
        name: &str,
        resource_version: Option<String>,
        conditions: Vec<CertificateSigningRequestCondition>,
    ) -> Result<CertificateSigningRequest> {
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": { "conditions": conditions },
        });
        let updated = self
            .api
            .patch_subresource("approval", name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(updated)
    }
}

/// Poll `name` until the signer issues a certificate
///
/// Returns the PEM certificate chain. A Denied or Failed condition, or no
/// certificate within `timeout`, is an error.
pub async fn wait_for_certificate(
    authority: &dyn SigningAuthority,
    name: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<String> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let csr = authority.get(name).await?;
        if let Some(status) = &csr.status {
            for condition in status.conditions.iter().flatten() {
                let reason = || {
                    condition
                        .message
                        .clone()
                        .or_else(|| condition.reason.clone())
                        .unwrap_or_default()
                };
                match condition.type_.as_str() {
                    "Denied" => {
                        return Err(PkiError::Denied {
                            name: name.to_string(),
                            reason: reason(),
                        })
                    }
                    "Failed" => {
                        return Err(PkiError::Failed {
                            name: name.to_string(),
                            reason: reason(),
                        })
                    }
                    _ => {}
                }
            }
            if let Some(cert) = status.certificate.as_ref().filter(|c| !c.0.is_empty()) {
                return String::from_utf8(cert.0.clone())
                    .map_err(|e| PkiError::Parse(format!("certificate is not UTF-8 PEM: {}", e)));
            }
        }

        trace!(csr = %name, "Certificate not issued yet");
        if tokio::time::Instant::now() + poll_interval > deadline {
            return Err(PkiError::Timeout(name.to_string()));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
