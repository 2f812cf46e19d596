//! CSR approval controller
//!
//! Watches every `CertificateSigningRequest` in the cluster and approves the
//! ones whose subject carries the tunnel organization. The kube-runtime
//! [`Controller`] owns the cache, the queue and the worker pool: it
//! coalesces bursts of updates, never reconciles one object concurrently and
//! requeues failures with the delay [`error_policy`] returns.
//!
//! Per object the controller only ever moves `Pending -> Approved`. Objects
//! that are malformed, out of scope or already decided are left untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use excalibur_common::TUNNEL_CSR_ORG;
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::authority::{approval_state, ApprovalState, SigningAuthority};
use crate::{PkiError, Result};

/// Reason recorded on conditions added by this controller
pub const APPROVAL_REASON: &str = "AutoApproved";

/// Message recorded on conditions added by this controller
pub const APPROVAL_MESSAGE: &str = "self-approving excalibur tunnel csr";

/// Delay before the first retry of a failed reconcile
const REQUEUE_BASE_DELAY: Duration = Duration::from_millis(5);

/// Upper bound on the per-object retry delay
const REQUEUE_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Whether `csr` carries a PKCS#10 request whose subject includes the
/// tunnel organization
///
/// Undecodable requests and other PEM block types are out of scope.
pub fn is_tunnel_request(csr: &CertificateSigningRequest) -> bool {
    let Ok(block) = ::pem::parse(&csr.spec.request.0) else {
        return false;
    };
    if block.tag() != "CERTIFICATE REQUEST" {
        return false;
    }
    let Ok((_, request)) = X509CertificationRequest::from_der(block.contents()) else {
        return false;
    };
    let in_scope = request
        .certification_request_info
        .subject
        .iter_organization()
        .any(|org| matches!(org.as_str(), Ok(o) if o == TUNNEL_CSR_ORG));
    in_scope
}

/// Condition recording this controller's approval
pub fn approved_condition() -> CertificateSigningRequestCondition {
    CertificateSigningRequestCondition {
        type_: "Approved".to_string(),
        status: "True".to_string(),
        reason: Some(APPROVAL_REASON.to_string()),
        message: Some(APPROVAL_MESSAGE.to_string()),
        last_update_time: Some(Time(Utc::now())),
        ..Default::default()
    }
}

/// What one reconcile pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Object was deleted before the approval landed
    Gone,
    /// Malformed or not scoped to the tunnel
    OutOfScope,
    /// Approved or denied already
    AlreadyDecided,
    /// Approval condition submitted
    Approved,
}

/// State shared by every reconcile of the approver
pub struct ApproverContext {
    authority: Arc<dyn SigningAuthority>,
    /// Consecutive failures per object name
    failures: Mutex<HashMap<String, u32>>,
}

impl ApproverContext {
    /// Approve through `authority`
    pub fn new(authority: Arc<dyn SigningAuthority>) -> Self {
        Self {
            authority,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Approve `csr` if it is a pending tunnel request
    ///
    /// The patch carries the resourceVersion that was read, so a decision
    /// that landed in between turns into a conflict instead of a second
    /// condition.
    pub async fn approve(&self, csr: &CertificateSigningRequest) -> Result<SyncOutcome> {
        let name = csr.name_any();

        if !is_tunnel_request(csr) {
            debug!(csr = %name, "Signing request not scoped to the tunnel, ignoring");
            return Ok(SyncOutcome::OutOfScope);
        }

        if approval_state(csr) != ApprovalState::Pending {
            debug!(csr = %name, "Signing request already decided");
            return Ok(SyncOutcome::AlreadyDecided);
        }

        let mut conditions = csr
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default();
        conditions.push(approved_condition());

        match self
            .authority
            .patch_approval(&name, csr.metadata.resource_version.clone(), conditions)
            .await
        {
            Ok(_) => {
                info!(csr = %name, "Approved tunnel signing request");
                Ok(SyncOutcome::Approved)
            }
            Err(e) if e.is_not_found() => {
                debug!(csr = %name, "Signing request gone, dropping");
                Ok(SyncOutcome::Gone)
            }
            Err(e) => Err(e),
        }
    }

    /// Record a failure of `name` and return the delay before its next try
    ///
    /// Doubles from 5ms per consecutive failure, capped at 1000s.
    pub fn next_retry_delay(&self, name: &str) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(name.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let exp = (*count - 1).min(31);
        REQUEUE_BASE_DELAY
            .saturating_mul(1u32 << exp)
            .min(REQUEUE_MAX_DELAY)
    }

    /// Consecutive failures recorded for `name`
    pub fn failures(&self, name: &str) -> u32 {
        self.failures.lock().get(name).copied().unwrap_or(0)
    }

    /// Reset the backoff of `name`
    pub fn forget(&self, name: &str) {
        self.failures.lock().remove(name);
    }
}

/// Reconcile one signing request from the controller cache
pub async fn reconcile(
    csr: Arc<CertificateSigningRequest>,
    ctx: Arc<ApproverContext>,
) -> Result<Action> {
    let outcome = ctx.approve(&csr).await?;
    ctx.forget(&csr.name_any());
    debug!(csr = %csr.name_any(), ?outcome, "Signing request reconciled");
    Ok(Action::await_change())
}

/// Requeue a failed reconcile with per-object exponential backoff
pub fn error_policy(
    csr: Arc<CertificateSigningRequest>,
    error: &PkiError,
    ctx: Arc<ApproverContext>,
) -> Action {
    let name = csr.name_any();
    let delay = ctx.next_retry_delay(&name);
    warn!(
        csr = %name,
        error = %error,
        requeues = ctx.failures(&name),
        delay_ms = delay.as_millis(),
        "Failed to reconcile signing request, requeuing"
    );
    Action::requeue(delay)
}

/// Short label for a watch failure
fn watch_error_kind(error: &watcher::Error) -> &'static str {
    match error {
        watcher::Error::InitialListFailed(_) => "initial-list",
        watcher::Error::WatchStartFailed(_) => "watch-start",
        watcher::Error::WatchError(_) => "watch-event",
        watcher::Error::WatchFailed(_) => "watch-stream",
        #[allow(unreachable_patterns)]
        _ => "other",
    }
}

/// Consecutive watch failures since the controller last made progress
#[derive(Debug, Default)]
pub struct WatchHealth {
    consecutive_failures: u32,
}

impl WatchHealth {
    /// Record a failure; returns the streak length
    pub fn failed(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    /// Record progress; returns the streak that just ended, if any
    pub fn recovered(&mut self) -> Option<u32> {
        match std::mem::take(&mut self.consecutive_failures) {
            0 => None,
            streak => Some(streak),
        }
    }
}

/// Auto-approves tunnel signing requests
pub struct CsrApprover {
    controller: Controller<CertificateSigningRequest>,
    ctx: Arc<ApproverContext>,
    workers: usize,
}

impl CsrApprover {
    /// Watch every signing request visible to `client` and approve through
    /// `authority` with at most `workers` concurrent reconciles
    pub fn new(client: Client, authority: Arc<dyn SigningAuthority>, workers: usize) -> Self {
        let api: Api<CertificateSigningRequest> = Api::all(client);
        let concurrency = u16::try_from(workers.max(1)).unwrap_or(u16::MAX);
        let controller = Controller::new(api, watcher::Config::default())
            .with_config(controller::Config::default().concurrency(concurrency));
        Self {
            controller,
            ctx: Arc::new(ApproverContext::new(authority)),
            workers,
        }
    }

    /// Cache the controller reconciles from
    pub fn store(&self) -> Store<CertificateSigningRequest> {
        self.controller.store()
    }

    /// Run until `stop` fires
    ///
    /// Reconciles in flight finish before this returns.
    pub async fn run(self, stop: CancellationToken) {
        info!(workers = self.workers, "Starting signing request approver");
        let mut health = WatchHealth::default();
        self.controller
            .graceful_shutdown_on(stop.cancelled_owned())
            .run(reconcile, error_policy, self.ctx)
            .for_each(|result| {
                match result {
                    Ok((csr, action)) => {
                        if let Some(streak) = health.recovered() {
                            info!(failures = streak, "Signing request watch recovered");
                        }
                        debug!(csr = %csr.name, ?action, "Signing request reconciliation completed");
                    }
                    Err(controller::Error::QueueError(e)) => {
                        let streak = health.failed();
                        warn!(
                            error = %e,
                            kind = watch_error_kind(&e),
                            consecutive_failures = streak,
                            "Signing request watch error"
                        );
                    }
                    // Already logged by error_policy
                    Err(controller::Error::ReconcilerFailed(..)) => {}
                    Err(e) => debug!(error = %e, "Signing request controller event dropped"),
                }
                futures::future::ready(())
            })
            .await;
        info!("Signing request approver stopped");
    }
}

/// Wait until `store` has loaded the initial list
///
/// Returns `false` if `stop` fires first or the controller went away.
pub async fn wait_for_cache_sync(
    store: &Store<CertificateSigningRequest>,
    stop: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        ready = store.wait_until_ready() => match ready {
            Ok(()) => {
                info!(count = store.len(), "Signing request cache synced");
                true
            }
            Err(e) => {
                warn!(error = %e, "Signing request cache closed before syncing");
                false
            }
        },
    }
}
