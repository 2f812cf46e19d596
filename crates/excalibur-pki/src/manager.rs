//! Certificate manager
//!
//! Owns one identity's lifecycle: build a template, generate a key, submit
//! a signing request, wait for the certificate, store it, and do it all
//! again before the certificate expires. Failures are logged and retried
//! in the background; callers only ever observe `current()` staying empty.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use excalibur_common::retry::{poll_until_ready, retry_until_cancelled, RetryConfig};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::authority::{wait_for_certificate, SigningAuthority, SigningRequest, DEFAULT_SIGNER_NAME};
use crate::credential::{Credential, CredentialSource};
use crate::store::CredentialStore;
use crate::template::{generate_key, TemplateFn};
use crate::Result;

/// Knobs for the signing round-trip and rotation schedule
#[derive(Debug, Clone)]
pub struct CertificateManagerConfig {
    /// Signer named in submitted requests
    pub signer_name: String,
    /// Requested certificate lifetime, if any
    pub expiration_seconds: Option<i32>,
    /// How long to wait for a decision on one request
    pub request_timeout: Duration,
    /// Interval between status checks while waiting
    pub poll_interval: Duration,
    /// Backoff between failed signing attempts
    pub retry: RetryConfig,
}

impl Default for CertificateManagerConfig {
    fn default() -> Self {
        Self {
            signer_name: DEFAULT_SIGNER_NAME.to_string(),
            expiration_seconds: None,
            request_timeout: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(2),
            retry: RetryConfig {
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(5 * 60),
                backoff_multiplier: 2.0,
            },
        }
    }
}

/// Requests, stores and rotates one certificate
pub struct CertificateManager {
    authority: Arc<dyn SigningAuthority>,
    store: Arc<CredentialStore>,
    template: TemplateFn,
    config: CertificateManagerConfig,
}

impl CertificateManager {
    /// Create a manager; nothing happens until [`CertificateManager::start`]
    pub fn new(
        authority: Arc<dyn SigningAuthority>,
        store: Arc<CredentialStore>,
        template: TemplateFn,
        config: CertificateManagerConfig,
    ) -> Self {
        Self {
            authority,
            store,
            template,
            config,
        }
    }

    /// Spawn the signing and rotation loop
    pub fn start(self: &Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run(stop).await })
    }

    async fn run(&self, stop: CancellationToken) {
        loop {
            let wait = match self.current() {
                Some(cred) => {
                    let deadline = rotation_deadline(&cred);
                    info!(
                        not_after = %cred.not_after(),
                        rotate_at = %deadline,
                        "Certificate rotation scheduled"
                    );
                    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
                }
                None => Duration::ZERO,
            };

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let rotated = tokio::select! {
                _ = stop.cancelled() => break,
                rotated = retry_until_cancelled(
                    &self.config.retry,
                    "rotate certificate",
                    &stop,
                    || self.rotate(),
                ) => rotated,
            };
            match rotated {
                Some(cred) => info!(
                    common_name = %cred.common_name(),
                    not_after = %cred.not_after(),
                    "Certificate rotated"
                ),
                None => break,
            }
        }
        debug!("Certificate manager stopped");
    }

    /// Obtain a new certificate and make it current
    ///
    /// One attempt: failures are returned, not retried.
    pub async fn rotate(&self) -> Result<Arc<Credential>> {
        let template = (self.template)()?;
        let role = template.role();
        let key = generate_key()?;
        let csr_pem = template.to_csr_pem(&key)?;

        let request = SigningRequest {
            csr_pem,
            signer_name: self.config.signer_name.clone(),
            usages: role.usages(),
            expiration_seconds: self.config.expiration_seconds,
        };
        let name = self.authority.submit(&request).await?;
        info!(csr = %name, common_name = %template.common_name, "Waiting for signing request to be approved");

        let cert_pem = wait_for_certificate(
            self.authority.as_ref(),
            &name,
            self.config.request_timeout,
            self.config.poll_interval,
        )
        .await?;

        let cred = Credential::from_pem(&cert_pem, Zeroizing::new(key.serialize_pem()))?;
        self.store.update(cred)
    }
}

impl CredentialSource for CertificateManager {
    fn current(&self) -> Option<Arc<Credential>> {
        self.store.current()
    }
}

/// When to start renewing `cred`: a random point in 70%..90% of its lifetime
pub fn rotation_deadline(cred: &Credential) -> DateTime<Utc> {
    deadline_between(cred.not_before(), cred.not_after())
}

fn deadline_between(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> DateTime<Utc> {
    let total = (not_after - not_before).num_milliseconds().max(0) as f64;
    let fraction = rand::thread_rng().gen_range(0.7..0.9);
    not_before + chrono::Duration::milliseconds((total * fraction) as i64)
}

/// Block until `source` has a credential, checking every `interval`
///
/// The first check is immediate. Returns `None` only if `stop` fires first.
pub async fn wait_for_current(
    source: &dyn CredentialSource,
    interval: Duration,
    stop: &CancellationToken,
) -> Option<Arc<Credential>> {
    poll_until_ready("signed certificate", interval, stop, || async {
        let current = source.current();
        if current.is_none() {
            info!("Waiting for the certificate to be signed");
        }
        Ok::<_, std::convert::Infallible>(current)
    })
    .await
}
