//! Hub-side certificate issuance for approved signing requests
//!
//! Used when the hub signs spoke certificates with its own CA rather than
//! leaving it to the API server's `kube-apiserver-client` signer. Only
//! requests with an `Approved` condition and no certificate are signed.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::csr::{self, TerminalState};
use crate::pki::CertificateAuthority;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::store::{LabelSelector, Requirement, ResourceStore};
use crate::{Error, Result, CLUSTER_NAME_LABEL};

/// Result of a signing attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SigningOutcome {
    /// This call wrote the certificate
    Signed,
    /// A certificate was already present
    AlreadySigned,
    /// The request has no terminal condition yet
    NotApproved,
    /// The request was denied and is never signed
    Denied,
}

/// Signs approved requests with the hub CA
pub struct CsrSigner {
    requests: Arc<dyn ResourceStore<CertificateSigningRequest>>,
    ca: Arc<CertificateAuthority>,
    retry: RetryConfig,
}

impl CsrSigner {
    /// Create a signer.
    ///
    /// Against a Kubernetes API server `requests` should write through the
    /// `status` subresource.
    pub fn new(
        requests: Arc<dyn ResourceStore<CertificateSigningRequest>>,
        ca: Arc<CertificateAuthority>,
    ) -> Self {
        Self {
            requests,
            ca,
            retry: RetryConfig::on_conflict(),
        }
    }

    /// Override the conflict budget
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sign one request if it is approved and unsigned.
    ///
    /// The certificate subject is bound to the cluster in the request's
    /// label, whatever the CSR itself asked for.
    #[instrument(skip(self))]
    pub async fn sign(&self, name: &str) -> Result<SigningOutcome> {
        let requests = &self.requests;
        let ca = self.ca.as_ref();

        let outcome = retry_on_conflict(&self.retry, "sign_signing_request", || async move {
            let mut request = requests.get(name).await?;

            match csr::terminal_state(&request) {
                None => return Ok(SigningOutcome::NotApproved),
                Some(TerminalState::Denied { .. }) => return Ok(SigningOutcome::Denied),
                Some(TerminalState::Approved) => {}
            }
            if csr::issued_certificate(&request).is_some() {
                return Ok(SigningOutcome::AlreadySigned);
            }

            let cluster = csr::cluster_name(&request)
                .ok_or_else(|| {
                    Error::validation(format!("signing request {name:?} has no cluster label"))
                })?
                .to_string();
            let certificate = ca.sign_csr(&csr::request_pem(&request)?, &cluster)?;

            request.status.get_or_insert_with(Default::default).certificate =
                Some(ByteString(certificate.into_bytes()));
            requests.update(&request).await?;
            Ok(SigningOutcome::Signed)
        })
        .await?;

        if outcome == SigningOutcome::Signed {
            info!("Issued certificate");
        }
        Ok(outcome)
    }

    /// Sign every approved, unsigned request for `cluster_name`.
    ///
    /// Stops at the first failure.
    pub async fn sign_cluster(&self, cluster_name: &str) -> Result<Vec<(String, SigningOutcome)>> {
        let selector = LabelSelector::eq(CLUSTER_NAME_LABEL, cluster_name);
        let mut outcomes = Vec::new();
        for request in self.requests.list(&selector).await? {
            let name = request.name_any();
            let outcome = self.sign(&name).await?;
            outcomes.push((name, outcome));
        }
        Ok(outcomes)
    }

    /// Sign approved requests of every cluster every `interval` until
    /// cancelled. A request that fails to sign is logged and skipped.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let selector =
            LabelSelector::everything().and(Requirement::Exists(CLUSTER_NAME_LABEL.to_string()));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let requests = match self.requests.list(&selector).await {
                Ok(requests) => requests,
                Err(e) => {
                    warn!(error = %e, "Failed to list signing requests");
                    continue;
                }
            };
            for request in requests {
                let name = request.name_any();
                if let Err(e) = self.sign(&name).await {
                    warn!(request = %name, error = %e, "Failed to sign request");
                }
            }
        }
    }
}
